//! qbol-engine — the link-layer messaging engine.
//!
//! Peers exchange custom Ethernet frames carrying a private EtherType;
//! everything above the raw link is implemented here: the reliability
//! layer (ACKs, retransmission, duplicate suppression), peer presence,
//! and file fragmentation/reassembly. The engine runs one task per role
//! over bounded queues, and reports back to its embedder through a
//! broadcast event sink.
//!
//! ```no_run
//! # async fn demo() -> Result<(), qbol_engine::EngineError> {
//! use std::sync::Arc;
//! use qbol_core::EngineConfig;
//! use qbol_engine::Engine;
//!
//! let engine = Engine::open("eth0", "ana", EngineConfig::default())?;
//! let dest = "aa:aa:aa:aa:aa:02".parse().unwrap();
//! engine.send_message(dest, "hola", true).await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use qbol_core::builder::FrameBuilder;
use qbol_core::config::EngineConfig;
use qbol_core::mac::MacAddr;
use qbol_core::wire::FrameKind;

mod ack;
pub mod error;
pub mod event;
pub mod link;
mod presence;
mod receiver;
mod router;
mod sender;
mod transfer;

pub use error::EngineError;
pub use event::{Event, TransferDirection};
pub use link::RawLink;
pub use presence::{PeerInfo, PeerState};

use ack::PendingTable;
use event::EventSink;
use presence::PeerRegistry;
use sender::TxQueue;
use transfer::{OutboundTransfers, TransferTable};

/// Buffered events before slow subscribers start losing history.
const EVENT_CAPACITY: usize = 1024;

/// Router input queue depth.
const ROUTER_QUEUE: usize = 512;

/// A running messaging engine. Cheap to clone; all clones share one
/// engine. Dropping every clone does not stop it — call [`Engine::shutdown`].
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: EngineConfig,
    key: Vec<u8>,
    link: Arc<dyn RawLink>,
    builder: Arc<FrameBuilder>,
    tx: TxQueue,
    pending: PendingTable,
    peers: PeerRegistry,
    inbound: TransferTable,
    transfers: OutboundTransfers,
    events_tx: broadcast::Sender<Event>,
    sink: EventSink,
    stop: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
    dropped: Arc<AtomicU64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Bind a raw socket on `interface` and start an engine over it.
    ///
    /// The only errors that unwind out of engine creation: the interface
    /// does not exist, or the process lacks CAP_NET_RAW.
    #[cfg(target_os = "linux")]
    pub fn open(
        interface: &str,
        user_name: impl Into<String>,
        cfg: EngineConfig,
    ) -> Result<Engine, EngineError> {
        let link = Arc::new(link::PacketSocket::bind(interface)?);
        Ok(Self::start(link, user_name, cfg))
    }

    /// Start an engine over an already-bound link endpoint.
    ///
    /// Must be called from within a tokio runtime. Announces presence
    /// immediately.
    pub fn start(
        link: Arc<dyn RawLink>,
        user_name: impl Into<String>,
        cfg: EngineConfig,
    ) -> Engine {
        let key = cfg.key().to_vec();
        let local_mac = link.local_mac();
        let builder = Arc::new(FrameBuilder::new(local_mac, user_name));

        let (sink, events_tx) = EventSink::new(EVENT_CAPACITY);
        let (queue_tx, queue_rx) = mpsc::channel(cfg.tx_queue_capacity);
        let tx = TxQueue::new(queue_tx, sink.clone());
        let (router_tx, router_rx) = mpsc::channel(ROUTER_QUEUE);

        let pending = PendingTable::new();
        let peers = PeerRegistry::new(sink.clone());
        let inbound = TransferTable::new(sink.clone());
        let transfers: OutboundTransfers = Arc::new(DashMap::new());
        let stop = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, _) = broadcast::channel(4);
        let dropped = Arc::new(AtomicU64::new(0));

        let mut tasks = Vec::new();

        tasks.push(receiver::spawn(
            link.clone(),
            router_tx,
            stop.clone(),
            dropped.clone(),
            key.clone(),
        ));

        tasks.push(tokio::spawn(
            router::Router::new(
                router_rx,
                tx.clone(),
                builder.clone(),
                pending.clone(),
                peers.clone(),
                inbound.clone(),
                transfers.clone(),
                sink.clone(),
                key.clone(),
                cfg.max_attempts,
                shutdown_tx.subscribe(),
            )
            .run(),
        ));

        tasks.push(tokio::spawn(sender::send_loop(
            queue_rx,
            link.clone(),
            sink.clone(),
            stop.clone(),
            shutdown_tx.clone(),
            shutdown_tx.subscribe(),
        )));

        tasks.push(tokio::spawn(ack::retransmit_loop(
            pending.clone(),
            tx.clone(),
            transfers.clone(),
            sink.clone(),
            cfg.ack_tick(),
            cfg.retransmit_interval(),
            cfg.max_attempts,
            shutdown_tx.subscribe(),
        )));

        tasks.push(tokio::spawn(presence::hello_loop(
            builder.clone(),
            tx.clone(),
            key.clone(),
            cfg.hello_interval(),
            shutdown_tx.subscribe(),
        )));

        tasks.push(tokio::spawn(presence::sweep_loop(
            peers.clone(),
            cfg.ack_tick(),
            cfg.presence_timeout(),
            cfg.presence_grace(),
            shutdown_tx.subscribe(),
        )));

        tasks.push(tokio::spawn(transfer::receive::sweep_loop(
            inbound.clone(),
            cfg.ack_tick(),
            cfg.transfer_timeout(),
            shutdown_tx.subscribe(),
        )));

        let engine = Engine {
            inner: Arc::new(Inner {
                cfg,
                key,
                link,
                builder,
                tx,
                pending,
                peers,
                inbound,
                transfers,
                events_tx,
                sink,
                stop,
                shutdown_tx,
                shutting_down: AtomicBool::new(false),
                dropped,
                tasks: Mutex::new(tasks),
            }),
        };

        engine.announce();
        tracing::info!(mac = %local_mac, name = engine.inner.builder.display_name(), "engine started");
        engine
    }

    /// Send a text message to one peer. Returns the frame's sequence
    /// number; for reliable sends that number identifies the eventual
    /// `DeliveryFailed` event if the peer never acknowledges.
    pub async fn send_message(
        &self,
        dest: MacAddr,
        text: &str,
        reliable: bool,
    ) -> Result<u32, EngineError> {
        self.ensure_running()?;
        self.check_mtu(text.len())?;

        let inner = &self.inner;
        let frame = if reliable {
            inner.builder.msg(dest, text)
        } else {
            inner.builder.msg_unreliable(dest, text)
        };
        let seq = frame.seq;
        let bytes = frame.encode(&inner.key)?;

        if reliable {
            // The record must exist before the frame can hit the wire, or
            // a fast ACK could race the insert.
            inner
                .pending
                .insert(dest, seq, FrameKind::Msg, 0, bytes.clone());
            if !inner.tx.push_reliable(bytes).await {
                inner.pending.retire(dest, seq);
                return Err(EngineError::ShutDown);
            }
        } else {
            inner.tx.push_unreliable(FrameKind::Msg, bytes);
        }
        Ok(seq)
    }

    /// Send a text message to every peer on the segment. Never reliable.
    pub async fn send_broadcast(&self, text: &str) -> Result<u32, EngineError> {
        self.ensure_running()?;
        self.check_mtu(text.len())?;

        let frame = self.inner.builder.broadcast_text(text);
        let seq = frame.seq;
        let bytes = frame.encode(&self.inner.key)?;
        self.inner.tx.push_unreliable(FrameKind::Msg, bytes);
        Ok(seq)
    }

    /// Start a file transfer and return its transfer id. The blob is
    /// fragmented and driven by a background task; completion or failure
    /// arrives on the event sink.
    pub fn send_file(
        &self,
        dest: MacAddr,
        blob: Bytes,
        reliable: bool,
    ) -> Result<u32, EngineError> {
        self.ensure_running()?;

        let inner = &self.inner;
        let ctx = transfer::send::SendContext {
            builder: inner.builder.clone(),
            tx: inner.tx.clone(),
            pending: inner.pending.clone(),
            transfers: inner.transfers.clone(),
            events: inner.sink.clone(),
            key: inner.key.clone(),
            payload_mtu: inner.cfg.payload_mtu,
            send_window: inner.cfg.send_window,
        };
        Ok(transfer::send::spawn(
            ctx,
            dest,
            blob,
            reliable,
            inner.shutdown_tx.subscribe(),
        ))
    }

    /// Broadcast an immediate presence beacon, outside the regular cadence.
    pub fn send_hello(&self) -> Result<(), EngineError> {
        self.ensure_running()?;
        let bytes = self.inner.builder.hello().encode(&self.inner.key)?;
        self.inner.tx.push_unreliable(FrameKind::Hello, bytes);
        Ok(())
    }

    /// Snapshot of every known peer.
    pub fn list_peers(&self) -> Vec<PeerInfo> {
        self.inner.peers.snapshot()
    }

    /// Subscribe to the event sink. Each receiver sees every event from
    /// its subscription onward.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.events_tx.subscribe()
    }

    pub fn local_mac(&self) -> MacAddr {
        self.inner.link.local_mac()
    }

    /// Frames discarded by the receive path (malformed, or queue overrun).
    pub fn frames_dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Reliable frames currently awaiting acknowledgement.
    pub fn unacked_frames(&self) -> usize {
        self.inner.pending.len()
    }

    /// Inbound transfers currently being reassembled.
    pub fn transfers_in_progress(&self) -> usize {
        self.inner.inbound.in_progress()
    }

    /// Stop the engine: announce departure, drain the transmit queue for
    /// at most the configured deadline, stop every task, and fail any
    /// outstanding file transfers. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("engine shutting down");

        match inner.builder.broadcast_offline().encode(&inner.key) {
            Ok(bytes) => inner.tx.push_unreliable(FrameKind::BroadcastOffline, bytes),
            Err(e) => tracing::warn!(error = %e, "failed to encode offline broadcast"),
        }

        // Let the departure frame (and anything queued before it) leave.
        let deadline = tokio::time::Instant::now() + inner.cfg.shutdown_drain();
        while !inner.tx.is_drained() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        inner.stop.store(true, Ordering::SeqCst);
        let _ = inner.shutdown_tx.send(());
        inner.link.close();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = inner.tasks.lock().unwrap();
            guard.drain(..).collect()
        };
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        tracing::info!("engine stopped");
    }

    fn announce(&self) {
        let inner = &self.inner;
        for frame in [inner.builder.broadcast_online(), inner.builder.hello()] {
            let kind = frame.kind;
            match frame.encode(&inner.key) {
                Ok(bytes) => inner.tx.push_unreliable(kind, bytes),
                Err(e) => tracing::warn!(error = %e, "failed to encode announcement"),
            }
        }
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.inner.shutting_down.load(Ordering::SeqCst)
            || self.inner.stop.load(Ordering::SeqCst)
        {
            return Err(EngineError::ShutDown);
        }
        Ok(())
    }

    fn check_mtu(&self, len: usize) -> Result<(), EngineError> {
        let mtu = self.inner.cfg.payload_mtu;
        if len > mtu {
            return Err(EngineError::PayloadTooLarge { len, mtu });
        }
        Ok(())
    }
}
