//! File sender — drives one outbound transfer: fragment, enqueue, and in
//! reliable mode hold a bounded window of unacked fragments.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use qbol_core::builder::FrameBuilder;
use qbol_core::mac::MacAddr;
use qbol_core::wire::FrameKind;

use crate::ack::PendingTable;
use crate::event::{Event, EventSink, TransferDirection};
use crate::sender::TxQueue;

use super::{split_chunks, OutboundTransfers, TransferSignal};

/// Everything an outbound driver needs, cloned from the engine.
#[derive(Clone)]
pub(crate) struct SendContext {
    pub builder: Arc<FrameBuilder>,
    pub tx: TxQueue,
    pub pending: PendingTable,
    pub transfers: OutboundTransfers,
    pub events: EventSink,
    pub key: Vec<u8>,
    pub payload_mtu: usize,
    pub send_window: usize,
}

/// Start a transfer driver and return its freshly drawn transfer id.
pub(crate) fn spawn(
    ctx: SendContext,
    dst: MacAddr,
    blob: Bytes,
    reliable: bool,
    shutdown: broadcast::Receiver<()>,
) -> u32 {
    // Ids are drawn uniformly from the 32-bit space; collisions with our
    // own live transfers are redrawn, collisions across peers tolerated.
    let mut transfer_id: u32 = rand::random();
    while ctx.transfers.contains_key(&transfer_id) {
        transfer_id = rand::random();
    }

    if reliable {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        ctx.transfers.insert(transfer_id, signal_tx);
        tokio::spawn(run_reliable(ctx, dst, blob, transfer_id, signal_rx, shutdown));
    } else {
        tokio::spawn(run_unreliable(ctx, dst, blob, transfer_id));
    }
    transfer_id
}

async fn run_reliable(
    ctx: SendContext,
    dst: MacAddr,
    blob: Bytes,
    transfer_id: u32,
    mut signals: mpsc::UnboundedReceiver<TransferSignal>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let chunks = split_chunks(&blob, ctx.payload_mtu);
    let total = chunks.len() as u32;

    tracing::info!(peer = %dst, transfer_id, total, bytes = blob.len(), "outbound transfer started");

    // fragment index -> sequence number of its in-flight frame
    let mut outstanding: HashMap<u32, u32> = HashMap::new();
    let mut next_index: u32 = 0;
    let mut acked: u32 = 0;
    let mut failure: Option<&'static str> = None;

    'drive: while acked < total {
        // Keep the window full.
        while outstanding.len() < ctx.send_window && next_index < total {
            let chunk = chunks[next_index as usize].clone();
            let frame = ctx
                .builder
                .file(dst, transfer_id, next_index, total, chunk, true);
            let seq = frame.seq;
            let bytes = match frame.encode(&ctx.key) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(error = %e, transfer_id, "failed to encode fragment");
                    failure = Some("fragment encoding failed");
                    break 'drive;
                }
            };
            ctx.pending
                .insert(dst, seq, FrameKind::File, transfer_id, bytes.clone());
            if !ctx.tx.push_reliable(bytes).await {
                failure = Some("engine shut down");
                break 'drive;
            }
            outstanding.insert(next_index, seq);
            next_index += 1;
        }

        tokio::select! {
            _ = shutdown.recv() => {
                failure = Some("engine shut down");
                break 'drive;
            }
            sig = signals.recv() => match sig {
                Some(TransferSignal::Acked(index)) => {
                    if let Some(seq) = outstanding.remove(&index) {
                        ctx.pending.retire(dst, seq);
                        acked += 1;
                    }
                }
                Some(TransferSignal::FragmentFailed) | None => {
                    failure = Some("fragment delivery failed");
                    break 'drive;
                }
            }
        }
    }

    // Abandon whatever is still in flight before reporting.
    for (_, seq) in outstanding {
        ctx.pending.retire(dst, seq);
    }
    ctx.transfers.remove(&transfer_id);

    match failure {
        None => {
            tracing::info!(peer = %dst, transfer_id, "outbound transfer complete");
            ctx.events.emit(Event::TransferCompleted {
                direction: TransferDirection::Outbound,
                peer: dst,
                transfer_id,
                bytes: Bytes::new(),
            });
        }
        Some(reason) => {
            tracing::warn!(peer = %dst, transfer_id, reason, "outbound transfer failed");
            ctx.events.emit(Event::TransferFailed {
                direction: TransferDirection::Outbound,
                peer: dst,
                transfer_id,
                reason: reason.into(),
            });
        }
    }
}

async fn run_unreliable(ctx: SendContext, dst: MacAddr, blob: Bytes, transfer_id: u32) {
    let chunks = split_chunks(&blob, ctx.payload_mtu);
    let total = chunks.len() as u32;

    tracing::info!(peer = %dst, transfer_id, total, bytes = blob.len(), "outbound transfer started (unreliable)");

    for (index, chunk) in chunks.into_iter().enumerate() {
        let frame = ctx
            .builder
            .file(dst, transfer_id, index as u32, total, chunk, false);
        match frame.encode(&ctx.key) {
            Ok(bytes) => ctx.tx.push_unreliable(FrameKind::File, bytes),
            Err(e) => {
                tracing::error!(error = %e, transfer_id, "failed to encode fragment");
                ctx.events.emit(Event::TransferFailed {
                    direction: TransferDirection::Outbound,
                    peer: dst,
                    transfer_id,
                    reason: "fragment encoding failed".into(),
                });
                return;
            }
        }
    }

    tracing::info!(peer = %dst, transfer_id, "outbound transfer enqueued");
    ctx.events.emit(Event::TransferCompleted {
        direction: TransferDirection::Outbound,
        peer: dst,
        transfer_id,
        bytes: Bytes::new(),
    });
}
