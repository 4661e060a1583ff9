//! File transfer — fragmentation on the way out, reassembly on the way in.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

pub(crate) mod receive;
pub(crate) mod send;

pub(crate) use receive::TransferTable;

/// Control messages delivered to an outbound transfer driver.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TransferSignal {
    /// The peer acknowledged this fragment index.
    Acked(u32),
    /// A fragment exhausted its retransmit attempts.
    FragmentFailed,
}

/// Live outbound transfer drivers, keyed by transfer id. The router and
/// the ACK manager signal drivers through this map.
pub(crate) type OutboundTransfers = Arc<DashMap<u32, mpsc::UnboundedSender<TransferSignal>>>;

/// Split a blob into MTU-sized fragments.
///
/// An empty blob still produces one (empty) fragment so the transfer has
/// a last-fragment frame to complete on.
pub(crate) fn split_chunks(blob: &Bytes, mtu: usize) -> Vec<Bytes> {
    if blob.is_empty() {
        return vec![Bytes::new()];
    }
    let mut chunks = Vec::with_capacity(blob.len().div_ceil(mtu));
    let mut offset = 0;
    while offset < blob.len() {
        let end = (offset + mtu).min(blob.len());
        chunks.push(blob.slice(offset..end));
        offset = end;
    }
    chunks
}
