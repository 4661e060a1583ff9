//! Transmit queue and sender — the single path from the engine to the wire.
//!
//! Producers never touch the link directly; they enqueue encoded frames
//! here and the sender task writes them out in FIFO order. Reliable
//! producers block while the queue is full; unreliable producers drop
//! with a warning instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use qbol_core::wire::FrameKind;

use crate::event::{Event, EventSink};
use crate::link::RawLink;

/// Consecutive write failures tolerated before the link is declared dead.
const MAX_WRITE_ERRORS: u32 = 8;

/// Producer-side handle on the transmit queue.
#[derive(Clone)]
pub(crate) struct TxQueue {
    tx: mpsc::Sender<Bytes>,
    events: EventSink,
}

impl TxQueue {
    pub fn new(tx: mpsc::Sender<Bytes>, events: EventSink) -> Self {
        Self { tx, events }
    }

    /// Enqueue a reliable frame, waiting for space if the queue is full.
    /// Returns false once the engine is shutting down.
    pub async fn push_reliable(&self, bytes: Bytes) -> bool {
        self.tx.send(bytes).await.is_ok()
    }

    /// Enqueue an unreliable frame. A full queue drops the frame with a
    /// warning; the producer never blocks.
    pub fn push_unreliable(&self, kind: FrameKind, bytes: Bytes) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(bytes) {
            tracing::warn!(?kind, "transmit queue full, dropping unreliable frame");
            self.events.emit(Event::QueueFull { kind });
        }
    }

    /// True once every enqueued frame has been handed to the sender.
    pub fn is_drained(&self) -> bool {
        self.tx.capacity() == self.tx.max_capacity()
    }
}

/// The sender task: pop frames FIFO and write them to the link.
///
/// One bad write is tolerated (the frame is lost; reliability recovers it);
/// a run of consecutive failures raises `LinkFailed` and brings the engine
/// down.
pub(crate) async fn send_loop(
    mut rx: mpsc::Receiver<Bytes>,
    link: Arc<dyn RawLink>,
    events: EventSink,
    stop: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut consecutive_errors = 0u32;

    loop {
        let bytes = tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("sender shutting down");
                return;
            }
            maybe = rx.recv() => match maybe {
                Some(bytes) => bytes,
                None => return,
            },
        };

        match link.send(&bytes) {
            Ok(()) => {
                consecutive_errors = 0;
            }
            Err(e) => {
                consecutive_errors += 1;
                tracing::warn!(error = %e, consecutive_errors, "link write failed");
                if consecutive_errors >= MAX_WRITE_ERRORS {
                    tracing::error!("link stopped accepting writes, shutting engine down");
                    events.emit(Event::LinkFailed);
                    stop.store(true, Ordering::SeqCst);
                    let _ = shutdown_tx.send(());
                    return;
                }
            }
        }
    }
}
