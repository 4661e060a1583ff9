//! ACK manager — tracks unacked reliable frames and drives retransmission.
//!
//! Every reliable frame gets a record here before it is enqueued. Records
//! are retired by an ACK (or FileAck, via the transfer driver), retried on
//! a timer, and dropped with a delivery-failure event once they exhaust
//! their attempts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;

use qbol_core::mac::MacAddr;
use qbol_core::wire::FrameKind;

use crate::event::{Event, EventSink};
use crate::sender::TxQueue;
use crate::transfer::{OutboundTransfers, TransferSignal};

/// One outbound reliable frame awaiting acknowledgement.
#[derive(Debug, Clone)]
pub(crate) struct PendingRecord {
    pub bytes: Bytes,
    pub kind: FrameKind,
    pub transfer_id: u32,
    pub dst: MacAddr,
    pub seq: u32,
    pub sent_at: Instant,
    /// Sends so far, the initial transmission included.
    pub attempts: u32,
    /// Insertion order; retransmits are replayed in this order.
    stamp: u64,
}

/// The table of outbound reliable records, keyed by (destination, sequence).
#[derive(Clone)]
pub(crate) struct PendingTable {
    records: Arc<DashMap<(MacAddr, u32), PendingRecord>>,
    next_stamp: Arc<AtomicU64>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            next_stamp: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a reliable frame about to be enqueued for its first send.
    pub fn insert(
        &self,
        dst: MacAddr,
        seq: u32,
        kind: FrameKind,
        transfer_id: u32,
        bytes: Bytes,
    ) {
        let stamp = self.next_stamp.fetch_add(1, Ordering::Relaxed);
        self.records.insert(
            (dst, seq),
            PendingRecord {
                bytes,
                kind,
                transfer_id,
                dst,
                seq,
                sent_at: Instant::now(),
                attempts: 1,
                stamp,
            },
        );
    }

    /// Retire the record acknowledged by `peer` for `seq`.
    /// Returns the record, or None when the ACK is stale or duplicated.
    pub fn retire(&self, peer: MacAddr, seq: u32) -> Option<PendingRecord> {
        self.records.remove(&(peer, seq)).map(|(_, rec)| rec)
    }

    /// Immediately requeue the named frame in response to a NACK, without
    /// waiting for the timer. Counts as an attempt; returns None when the
    /// record is unknown or already out of attempts.
    pub fn fast_retransmit(&self, peer: MacAddr, seq: u32, max_attempts: u32) -> Option<Bytes> {
        let mut rec = self.records.get_mut(&(peer, seq))?;
        if rec.attempts >= max_attempts {
            return None;
        }
        rec.attempts += 1;
        rec.sent_at = Instant::now();
        Some(rec.bytes.clone())
    }

    /// Scan for records whose retransmit interval has elapsed.
    ///
    /// Records with attempts left are bumped and returned in `retries`
    /// (sorted by insertion order); exhausted records are removed and
    /// returned in `expired`.
    pub fn scan(
        &self,
        now: Instant,
        interval: Duration,
        max_attempts: u32,
    ) -> (Vec<Bytes>, Vec<PendingRecord>) {
        let mut retries: Vec<(u64, Bytes)> = Vec::new();
        let mut exhausted: Vec<(MacAddr, u32)> = Vec::new();

        for mut entry in self.records.iter_mut() {
            if now.duration_since(entry.sent_at) <= interval {
                continue;
            }
            if entry.attempts >= max_attempts {
                exhausted.push((entry.dst, entry.seq));
            } else {
                entry.attempts += 1;
                entry.sent_at = now;
                retries.push((entry.stamp, entry.bytes.clone()));
            }
        }

        retries.sort_by_key(|(stamp, _)| *stamp);

        let mut expired = Vec::with_capacity(exhausted.len());
        for key in exhausted {
            if let Some((_, rec)) = self.records.remove(&key) {
                expired.push(rec);
            }
        }
        expired.sort_by_key(|rec| rec.stamp);

        (retries.into_iter().map(|(_, b)| b).collect(), expired)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The retransmit ticker. Runs until shutdown.
pub(crate) async fn retransmit_loop(
    table: PendingTable,
    tx: TxQueue,
    transfers: OutboundTransfers,
    events: EventSink,
    tick: Duration,
    interval: Duration,
    max_attempts: u32,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("ack manager shutting down");
                return;
            }

            _ = ticker.tick() => {
                let (retries, expired) = table.scan(Instant::now(), interval, max_attempts);

                for bytes in retries {
                    if !tx.push_reliable(bytes).await {
                        return;
                    }
                }

                for rec in expired {
                    tracing::warn!(
                        dst = %rec.dst,
                        seq = rec.seq,
                        kind = ?rec.kind,
                        attempts = rec.attempts,
                        "reliable frame gave up"
                    );
                    match rec.kind {
                        FrameKind::File => {
                            // The transfer driver owns the failure event.
                            if let Some(driver) = transfers.get(&rec.transfer_id) {
                                let _ = driver.send(TransferSignal::FragmentFailed);
                            }
                        }
                        _ => {
                            events.emit(Event::DeliveryFailed {
                                dest: rec.dst,
                                seq: rec.seq,
                            });
                        }
                    }
                }
            }
        }
    }
}
