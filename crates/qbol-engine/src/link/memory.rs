//! In-process link — a hub that shuttles frames between engines without a
//! network interface. Used by the integration tests and by demos that run
//! several engines in one process.
//!
//! The hub honours broadcast addressing and can be given a drop filter to
//! model a lossy segment (lost ACKs, black-holed directions).

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;

use qbol_core::mac::MacAddr;
use qbol_core::wire;

use super::RawLink;

/// Decides whether a frame is dropped in flight.
/// Arguments: source MAC, destination MAC, raw frame bytes.
pub type DropFilter = dyn Fn(MacAddr, MacAddr, &[u8]) -> bool + Send + Sync;

/// How long one blocking read waits before surfacing `WouldBlock`.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// A virtual segment connecting [`MemoryLink`] endpoints.
pub struct MemoryHub {
    ports: DashMap<MacAddr, Sender<Vec<u8>>>,
    filter: RwLock<Option<Arc<DropFilter>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ports: DashMap::new(),
            filter: RwLock::new(None),
        })
    }

    /// Register a new endpoint with the given hardware address.
    pub fn attach(self: &Arc<Self>, mac: MacAddr) -> MemoryLink {
        let (tx, rx) = channel();
        self.ports.insert(mac, tx);
        MemoryLink {
            hub: self.clone(),
            mac,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    /// Install a loss model. Frames for which the filter returns true are
    /// silently dropped.
    pub fn set_drop_filter(&self, filter: impl Fn(MacAddr, MacAddr, &[u8]) -> bool + Send + Sync + 'static) {
        *self.filter.write().unwrap() = Some(Arc::new(filter));
    }

    /// Remove the loss model; the segment becomes lossless again.
    pub fn clear_drop_filter(&self) {
        *self.filter.write().unwrap() = None;
    }

    fn deliver(&self, from: MacAddr, frame: &[u8]) {
        let Some(dst) = wire::peek_dst(frame) else {
            return;
        };

        let filter = self.filter.read().unwrap().clone();
        if let Some(filter) = filter {
            if filter(from, dst, frame) {
                return;
            }
        }

        if dst.is_broadcast() {
            for port in self.ports.iter() {
                if *port.key() != from {
                    let _ = port.value().send(frame.to_vec());
                }
            }
        } else if let Some(port) = self.ports.get(&dst) {
            let _ = port.value().send(frame.to_vec());
        }
        // Frames to unknown destinations vanish, as on a real segment.
    }
}

/// One endpoint on a [`MemoryHub`].
pub struct MemoryLink {
    hub: Arc<MemoryHub>,
    mac: MacAddr,
    rx: Mutex<Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl RawLink for MemoryLink {
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "link closed"));
        }
        self.hub.deliver(self.mac, frame);
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "link closed"));
        }
        let rx = self.rx.lock().unwrap();
        match rx.recv_timeout(READ_TIMEOUT) {
            Ok(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "no frame"))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "hub gone"))
            }
        }
    }

    fn local_mac(&self) -> MacAddr {
        self.mac
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.hub.ports.remove(&self.mac);
    }
}
