//! File assembler — rebuilds blobs from File fragments, in any arrival
//! order, and times out transfers that go quiet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;

use qbol_core::mac::MacAddr;

use crate::event::{Event, EventSink, TransferDirection};

/// One in-progress inbound transfer.
struct InboundTransfer {
    total: u32,
    fragments: HashMap<u32, Bytes>,
    received_bytes: usize,
    started_at: Instant,
    last_activity: Instant,
}

/// All in-progress inbound transfers, keyed by (source, transfer id).
#[derive(Clone)]
pub(crate) struct TransferTable {
    transfers: Arc<DashMap<(MacAddr, u32), InboundTransfer>>,
    events: EventSink,
}

impl TransferTable {
    pub fn new(events: EventSink) -> Self {
        Self {
            transfers: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Fold one fragment in. Emits `TransferCompleted` when the last gap
    /// closes; duplicate fragments only refresh the activity clock.
    pub fn accept(&self, src: MacAddr, transfer_id: u32, index: u32, total: u32, payload: Bytes) {
        let key = (src, transfer_id);
        let now = Instant::now();

        let mut entry = self.transfers.entry(key).or_insert_with(|| {
            tracing::info!(peer = %src, transfer_id, total, "inbound transfer started");
            InboundTransfer {
                total,
                fragments: HashMap::new(),
                received_bytes: 0,
                started_at: now,
                last_activity: now,
            }
        });

        entry.last_activity = now;
        if total != entry.total {
            tracing::warn!(
                peer = %src,
                transfer_id,
                expected = entry.total,
                got = total,
                "fragment disagrees on total count, keeping first"
            );
        }
        if entry.fragments.contains_key(&index) {
            return;
        }
        entry.received_bytes += payload.len();
        entry.fragments.insert(index, payload);

        let complete = entry.fragments.len() as u32 == entry.total;
        drop(entry);

        if complete {
            if let Some((_, transfer)) = self.transfers.remove(&key) {
                let bytes = reassemble(transfer);
                tracing::info!(
                    peer = %src,
                    transfer_id,
                    bytes = bytes.len(),
                    "inbound transfer complete"
                );
                self.events.emit(Event::TransferCompleted {
                    direction: TransferDirection::Inbound,
                    peer: src,
                    transfer_id,
                    bytes,
                });
            }
        }
    }

    /// Discard transfers idle past `timeout`, raising `TransferFailed`.
    pub fn sweep(&self, now: Instant, timeout: Duration) {
        let mut stale: Vec<(MacAddr, u32)> = Vec::new();
        for entry in self.transfers.iter() {
            if now.duration_since(entry.last_activity) > timeout {
                stale.push(*entry.key());
            }
        }
        for key in stale {
            if let Some(((src, transfer_id), transfer)) = self.transfers.remove(&key) {
                tracing::warn!(
                    peer = %src,
                    transfer_id,
                    have = transfer.fragments.len(),
                    total = transfer.total,
                    age_secs = now.duration_since(transfer.started_at).as_secs(),
                    "inbound transfer timed out"
                );
                self.events.emit(Event::TransferFailed {
                    direction: TransferDirection::Inbound,
                    peer: src,
                    transfer_id,
                    reason: "transfer idle past timeout".into(),
                });
            }
        }
    }

    pub fn in_progress(&self) -> usize {
        self.transfers.len()
    }
}

fn reassemble(transfer: InboundTransfer) -> Bytes {
    let mut out = BytesMut::with_capacity(transfer.received_bytes);
    for index in 0..transfer.total {
        if let Some(fragment) = transfer.fragments.get(&index) {
            out.extend_from_slice(fragment);
        }
    }
    out.freeze()
}

/// Run the idle-transfer cleanup on the shared tick cadence until shutdown.
pub(crate) async fn sweep_loop(
    table: TransferTable,
    tick: Duration,
    timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => table.sweep(Instant::now(), timeout),
        }
    }
}
