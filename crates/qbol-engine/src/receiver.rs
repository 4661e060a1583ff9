//! Receiver — the blocking read loop between the link and the router.
//!
//! Accepts only frames carrying our EtherType and addressed to this
//! engine (or broadcast), decodes them, and pushes them onto the router's
//! input queue. A bad frame is counted and skipped; the loop never dies
//! over one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use qbol_core::mac::MacAddr;
use qbol_core::wire::{self, Frame, ETHERTYPE};

use crate::link::RawLink;

/// Read errors tolerated back-to-back before the loop gives up.
const MAX_READ_ERRORS: u32 = 16;

/// Run the receive loop on the blocking thread pool.
pub(crate) fn spawn(
    link: Arc<dyn RawLink>,
    router_tx: mpsc::Sender<Frame>,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    key: Vec<u8>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || receive_loop(link, router_tx, stop, dropped, key))
}

fn receive_loop(
    link: Arc<dyn RawLink>,
    router_tx: mpsc::Sender<Frame>,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    key: Vec<u8>,
) {
    let local_mac = link.local_mac();
    let mut buf = vec![0u8; 65536];
    let mut consecutive_errors = 0u32;

    while !stop.load(Ordering::SeqCst) {
        let len = match link.recv(&mut buf) {
            Ok(len) => {
                consecutive_errors = 0;
                len
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                consecutive_errors += 1;
                if stop.load(Ordering::SeqCst) || consecutive_errors >= MAX_READ_ERRORS {
                    tracing::debug!(error = %e, "receive loop exiting");
                    return;
                }
                tracing::warn!(error = %e, "link read failed");
                std::thread::sleep(std::time::Duration::from_millis(50));
                continue;
            }
        };

        let raw = &buf[..len];
        if wire::peek_ethertype(raw) != Some(ETHERTYPE) {
            continue;
        }
        if !accepts(local_mac, wire::peek_dst(raw)) {
            continue;
        }

        match Frame::decode(raw, &key) {
            // Packet sockets also see our own outgoing broadcasts.
            Ok(frame) if frame.src == local_mac => continue,
            Ok(frame) => {
                if let Err(e) = router_tx.try_send(frame) {
                    match e {
                        mpsc::error::TrySendError::Full(_) => {
                            dropped.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("router queue full, dropping frame");
                        }
                        mpsc::error::TrySendError::Closed(_) => return,
                    }
                }
            }
            Err(e) => {
                dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(error = %e, "dropping malformed frame");
            }
        }
    }
}

fn accepts(local_mac: MacAddr, dst: Option<MacAddr>) -> bool {
    match dst {
        Some(dst) => dst == local_mac || dst.is_broadcast(),
        None => false,
    }
}
