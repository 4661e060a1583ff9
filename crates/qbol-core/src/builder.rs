//! Frame construction — one constructor per frame kind.
//!
//! The builder owns the engine's sequence counter and stamps every frame
//! it produces with the local MAC and a fresh, strictly increasing
//! sequence number. Constructors take semantic inputs and fill the unused
//! numeric fields with zero.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;

use crate::mac::MacAddr;
use crate::wire::{Frame, FrameFlags, FrameKind};

/// Builds frames on behalf of one engine.
pub struct FrameBuilder {
    local_mac: MacAddr,
    display_name: String,
    seq: AtomicU32,
}

impl FrameBuilder {
    pub fn new(local_mac: MacAddr, display_name: impl Into<String>) -> Self {
        Self {
            local_mac,
            display_name: display_name.into(),
            seq: AtomicU32::new(0),
        }
    }

    pub fn local_mac(&self) -> MacAddr {
        self.local_mac
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn base(&self, dst: MacAddr, kind: FrameKind, flags: FrameFlags, payload: Bytes) -> Frame {
        Frame {
            dst,
            src: self.local_mac,
            kind,
            flags,
            seq: self.next_seq(),
            transfer_id: 0,
            frag_index: 0,
            frag_total: 0,
            payload,
        }
    }

    /// A reliable text message to one peer.
    pub fn msg(&self, dst: MacAddr, text: &str) -> Frame {
        self.base(
            dst,
            FrameKind::Msg,
            FrameFlags::empty().with_reliable(true),
            Bytes::copy_from_slice(text.as_bytes()),
        )
    }

    /// A fire-and-forget text message to one peer.
    pub fn msg_unreliable(&self, dst: MacAddr, text: &str) -> Frame {
        self.base(
            dst,
            FrameKind::Msg,
            FrameFlags::empty(),
            Bytes::copy_from_slice(text.as_bytes()),
        )
    }

    /// A text message to every peer on the segment. Broadcasts are never
    /// reliable: receivers must not ACK them.
    pub fn broadcast_text(&self, text: &str) -> Frame {
        self.base(
            MacAddr::BROADCAST,
            FrameKind::Msg,
            FrameFlags::empty(),
            Bytes::copy_from_slice(text.as_bytes()),
        )
    }

    /// Acknowledges the reliable frame `acked_seq` received from `dst`.
    /// The payload carries the acknowledged sequence number, big-endian.
    pub fn ack(&self, dst: MacAddr, acked_seq: u32) -> Frame {
        self.base(
            dst,
            FrameKind::Ack,
            FrameFlags::empty(),
            Bytes::copy_from_slice(&acked_seq.to_be_bytes()),
        )
    }

    /// Requests immediate retransmission of `seq` from `dst`.
    pub fn nack(&self, dst: MacAddr, seq: u32) -> Frame {
        self.base(
            dst,
            FrameKind::Nack,
            FrameFlags::empty(),
            Bytes::copy_from_slice(&seq.to_be_bytes()),
        )
    }

    /// One fragment of a file transfer. Sets the last-fragment flag on the
    /// final index.
    ///
    /// Callers must keep `index < total`; the codec rejects anything else.
    pub fn file(
        &self,
        dst: MacAddr,
        transfer_id: u32,
        index: u32,
        total: u32,
        chunk: Bytes,
        reliable: bool,
    ) -> Frame {
        debug_assert!(index < total);
        let flags = FrameFlags::empty()
            .with_reliable(reliable)
            .with_last_fragment(index == total - 1);
        Frame {
            transfer_id,
            frag_index: index,
            frag_total: total,
            ..self.base(dst, FrameKind::File, flags, chunk)
        }
    }

    /// Acknowledges one File fragment. Transfer id and fragment index ride
    /// in the header; the payload is empty.
    pub fn file_ack(&self, dst: MacAddr, transfer_id: u32, index: u32) -> Frame {
        Frame {
            transfer_id,
            frag_index: index,
            // Keep the codec's index < total invariant satisfied for peers
            // that validate FileAck like File.
            frag_total: index + 1,
            ..self.base(dst, FrameKind::FileAck, FrameFlags::empty(), Bytes::new())
        }
    }

    /// The periodic presence beacon, addressed to the broadcast MAC.
    pub fn hello(&self) -> Frame {
        self.base(
            MacAddr::BROADCAST,
            FrameKind::Hello,
            FrameFlags::empty(),
            Bytes::copy_from_slice(self.display_name.as_bytes()),
        )
    }

    /// Announces this engine coming online.
    pub fn broadcast_online(&self) -> Frame {
        self.base(
            MacAddr::BROADCAST,
            FrameKind::BroadcastOnline,
            FrameFlags::empty(),
            Bytes::copy_from_slice(self.display_name.as_bytes()),
        )
    }

    /// Announces a graceful departure.
    pub fn broadcast_offline(&self) -> Frame {
        self.base(
            MacAddr::BROADCAST,
            FrameKind::BroadcastOffline,
            FrameFlags::empty(),
            Bytes::new(),
        )
    }

    /// Parse the payload of an Ack or Nack frame.
    pub fn acked_seq(payload: &[u8]) -> Option<u32> {
        let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }
}
