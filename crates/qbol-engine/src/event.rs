//! Application events — everything the engine reports back to its embedder.

use bytes::Bytes;
use tokio::sync::broadcast;

use qbol_core::mac::MacAddr;
use qbol_core::wire::FrameKind;

/// Whether a transfer event concerns data we were sending or receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Inbound,
    Outbound,
}

/// Events pushed to the application sink.
///
/// Cheap to clone: completed-transfer payloads are reference-counted.
#[derive(Debug, Clone)]
pub enum Event {
    /// A unicast text message arrived. Delivered exactly once per
    /// (source, sequence), even when the sender retransmits.
    MessageReceived {
        src: MacAddr,
        seq: u32,
        text: String,
    },

    /// A broadcast text message arrived.
    BroadcastReceived { src: MacAddr, text: String },

    /// A peer was first seen, or came back after being offline.
    PeerOnline { mac: MacAddr, name: String },

    /// A peer went silent past the presence timeout, or announced a
    /// graceful departure.
    PeerOffline { mac: MacAddr },

    /// A file transfer finished. For inbound transfers `bytes` is the
    /// reassembled blob; for outbound transfers it is empty.
    TransferCompleted {
        direction: TransferDirection,
        peer: MacAddr,
        transfer_id: u32,
        bytes: Bytes,
    },

    /// A file transfer was abandoned.
    TransferFailed {
        direction: TransferDirection,
        peer: MacAddr,
        transfer_id: u32,
        reason: String,
    },

    /// A reliable frame exhausted its retransmit attempts.
    DeliveryFailed { dest: MacAddr, seq: u32 },

    /// An unreliable frame was dropped because the transmit queue was full.
    QueueFull { kind: FrameKind },

    /// The link endpoint stopped accepting writes; the engine is going down.
    LinkFailed,
}

/// Shared handle for emitting events.
///
/// A send with no subscribers is not an error; events are best-effort
/// notifications, and the engine never blocks on its embedder.
#[derive(Clone)]
pub(crate) struct EventSink(broadcast::Sender<Event>);

impl EventSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Sender<Event>) {
        let (tx, _) = broadcast::channel(capacity);
        (EventSink(tx.clone()), tx)
    }

    pub fn emit(&self, event: Event) {
        let _ = self.0.send(event);
    }
}
