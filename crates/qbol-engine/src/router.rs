//! Router — single-threaded dispatch of validated inbound frames.
//!
//! Every frame that reaches this point already passed the EtherType and
//! address filters and the CRC. The router feeds presence, retires or
//! synthesizes ACKs, hands fragments to the assembler, and suppresses
//! duplicate reliable frames behind a per-peer window of recently seen
//! sequence numbers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use qbol_core::builder::FrameBuilder;
use qbol_core::mac::MacAddr;
use qbol_core::wire::{Frame, FrameKind};

use crate::ack::PendingTable;
use crate::event::{Event, EventSink};
use crate::presence::PeerRegistry;
use crate::sender::TxQueue;
use crate::transfer::{OutboundTransfers, TransferSignal, TransferTable};

/// Sequence numbers remembered per peer for duplicate suppression.
const DUP_WINDOW: usize = 256;

/// Recently seen sequence numbers from one peer, FIFO-evicted.
#[derive(Default)]
struct DupWindow {
    seen: HashSet<u32>,
    order: VecDeque<u32>,
}

impl DupWindow {
    /// Record `seq`; returns false when it was already in the window.
    fn insert(&mut self, seq: u32) -> bool {
        if !self.seen.insert(seq) {
            return false;
        }
        self.order.push_back(seq);
        if self.order.len() > DUP_WINDOW {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

pub(crate) struct Router {
    rx: mpsc::Receiver<Frame>,
    tx: TxQueue,
    builder: Arc<FrameBuilder>,
    pending: PendingTable,
    peers: PeerRegistry,
    inbound: TransferTable,
    transfers: OutboundTransfers,
    events: EventSink,
    key: Vec<u8>,
    max_attempts: u32,
    windows: HashMap<MacAddr, DupWindow>,
    shutdown: broadcast::Receiver<()>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<Frame>,
        tx: TxQueue,
        builder: Arc<FrameBuilder>,
        pending: PendingTable,
        peers: PeerRegistry,
        inbound: TransferTable,
        transfers: OutboundTransfers,
        events: EventSink,
        key: Vec<u8>,
        max_attempts: u32,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            rx,
            tx,
            builder,
            pending,
            peers,
            inbound,
            transfers,
            events,
            key,
            max_attempts,
            windows: HashMap::new(),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!("router shutting down");
                    return;
                }
                maybe = self.rx.recv() => match maybe {
                    Some(frame) => frame,
                    None => return,
                },
            };
            self.handle(frame).await;
        }
    }

    async fn handle(&mut self, frame: Frame) {
        self.peers.observe(frame.src, frame.kind, &frame.payload);

        match frame.kind {
            FrameKind::Msg => self.handle_msg(frame).await,
            FrameKind::Ack => self.handle_ack(frame),
            FrameKind::Nack => self.handle_nack(frame).await,
            FrameKind::File => self.handle_file(frame),
            FrameKind::FileAck => self.handle_file_ack(frame),
            // Presence kinds are fully handled by observe above.
            FrameKind::Hello | FrameKind::BroadcastOnline | FrameKind::BroadcastOffline => {}
            FrameKind::Ctrl => {
                tracing::warn!(src = %frame.src, seq = frame.seq, "unknown ctrl frame, dropping");
            }
        }
    }

    async fn handle_msg(&mut self, frame: Frame) {
        let text = String::from_utf8_lossy(&frame.payload).into_owned();

        if frame.dst.is_broadcast() {
            // Broadcasts are delivered as-is and never acknowledged.
            self.events.emit(Event::BroadcastReceived {
                src: frame.src,
                text,
            });
            return;
        }

        if !frame.flags.reliable() {
            self.events.emit(Event::MessageReceived {
                src: frame.src,
                seq: frame.seq,
                text,
            });
            return;
        }

        let fresh = self.window(frame.src).insert(frame.seq);
        if fresh {
            self.events.emit(Event::MessageReceived {
                src: frame.src,
                seq: frame.seq,
                text,
            });
        } else {
            tracing::debug!(src = %frame.src, seq = frame.seq, "duplicate message, re-acking only");
        }

        // Duplicates are re-ACKed: the original ACK may have been lost.
        self.send_ack(frame.src, frame.seq);
    }

    fn handle_ack(&mut self, frame: Frame) {
        match FrameBuilder::acked_seq(&frame.payload) {
            Some(seq) => {
                if self.pending.retire(frame.src, seq).is_none() {
                    tracing::debug!(src = %frame.src, seq, "stale ack");
                }
            }
            None => tracing::debug!(src = %frame.src, "ack without a sequence payload"),
        }
    }

    async fn handle_nack(&mut self, frame: Frame) {
        let Some(seq) = FrameBuilder::acked_seq(&frame.payload) else {
            tracing::debug!(src = %frame.src, "nack without a sequence payload");
            return;
        };
        match self.pending.fast_retransmit(frame.src, seq, self.max_attempts) {
            Some(bytes) => {
                tracing::debug!(src = %frame.src, seq, "nack, retransmitting immediately");
                self.tx.push_reliable(bytes).await;
            }
            None => tracing::debug!(src = %frame.src, seq, "nack for unknown frame"),
        }
    }

    fn handle_file(&mut self, frame: Frame) {
        let reliable = frame.flags.reliable();

        let fresh = if reliable {
            self.window(frame.src).insert(frame.seq)
        } else {
            true
        };

        if fresh {
            self.inbound.accept(
                frame.src,
                frame.transfer_id,
                frame.frag_index,
                frame.frag_total,
                frame.payload,
            );
        }

        if reliable {
            let ack = self
                .builder
                .file_ack(frame.src, frame.transfer_id, frame.frag_index);
            match ack.encode(&self.key) {
                Ok(bytes) => self.tx.push_unreliable(FrameKind::FileAck, bytes),
                Err(e) => tracing::warn!(error = %e, "failed to encode file ack"),
            }
        }
    }

    fn handle_file_ack(&mut self, frame: Frame) {
        match self.transfers.get(&frame.transfer_id) {
            Some(driver) => {
                let _ = driver.send(TransferSignal::Acked(frame.frag_index));
            }
            None => tracing::debug!(
                src = %frame.src,
                transfer_id = frame.transfer_id,
                "file ack for unknown transfer"
            ),
        }
    }

    fn send_ack(&mut self, dst: MacAddr, seq: u32) {
        let ack = self.builder.ack(dst, seq);
        match ack.encode(&self.key) {
            Ok(bytes) => self.tx.push_unreliable(FrameKind::Ack, bytes),
            Err(e) => tracing::warn!(error = %e, "failed to encode ack"),
        }
    }

    fn window(&mut self, peer: MacAddr) -> &mut DupWindow {
        self.windows.entry(peer).or_default()
    }
}
