//! QBol wire format — the on-wire frame and its codec.
//!
//! These types ARE the protocol. Every field, every size, every flag bit
//! is part of the wire format; changing anything here is a breaking change
//! for every peer on the segment.
//!
//! A frame is a raw Ethernet frame carrying our private EtherType. The
//! header is #[repr(C, packed)] with explicit big-endian integer fields and
//! zerocopy derives, so serialization is deterministic and allocation-free.
//! The payload is obfuscated with a repeating XOR key, and the whole frame
//! (header + obfuscated payload) is covered by a trailing CRC-32.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::mac::MacAddr;

// ── Constants ─────────────────────────────────────────────────────────────────

/// The private EtherType selecting frames that belong to this protocol.
pub const ETHERTYPE: u16 = 0x88B5;

/// Fixed header size in bytes, before the payload.
pub const HEADER_SIZE: usize = 34;

/// Trailing CRC-32 size in bytes.
pub const CRC_SIZE: usize = 4;

/// Default maximum cleartext payload per frame. Chosen to keep the full
/// frame under a 1500-byte interface MTU with headroom.
pub const DEFAULT_PAYLOAD_MTU: usize = 1400;

/// Hard upper bound on payload size — the length field is 16 bits.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Shared obfuscation key used when none is configured.
pub const DEFAULT_OBFUSCATION_KEY: &[u8] = b"qbol-segment-key-v1";

// ── Frame kind ────────────────────────────────────────────────────────────────

/// Discriminator for the nine frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Text message, unicast or broadcast.
    Msg = 1,
    /// Acknowledges a reliable frame; payload carries the acked sequence.
    Ack = 2,
    /// Fast-retransmit hint for the sequence named in the payload.
    Nack = 3,
    /// One fragment of a file transfer.
    File = 4,
    /// Acknowledges a single File fragment (transfer id + index in header).
    FileAck = 5,
    /// Periodic presence beacon; payload carries the display name.
    Hello = 6,
    /// Announces the sender coming online; payload carries the display name.
    BroadcastOnline = 7,
    /// Announces a graceful departure.
    BroadcastOffline = 8,
    /// Reserved for protocol control extensions.
    Ctrl = 9,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Msg),
            2 => Ok(FrameKind::Ack),
            3 => Ok(FrameKind::Nack),
            4 => Ok(FrameKind::File),
            5 => Ok(FrameKind::FileAck),
            6 => Ok(FrameKind::Hello),
            7 => Ok(FrameKind::BroadcastOnline),
            8 => Ok(FrameKind::BroadcastOffline),
            9 => Ok(FrameKind::Ctrl),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> u8 {
        kind as u8
    }
}

// ── Flags ─────────────────────────────────────────────────────────────────────

/// The frame flags byte.
///
/// Bit 0: delivery is guarded by ACK tracking and retransmission.
/// Bit 1: this File fragment is the last of its transfer.
/// Bits 2-7: reserved, must be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const RELIABLE: u8 = 0b0000_0001;
    pub const LAST_FRAGMENT: u8 = 0b0000_0010;

    pub const fn empty() -> Self {
        FrameFlags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        FrameFlags(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub fn reliable(&self) -> bool {
        self.0 & Self::RELIABLE != 0
    }

    pub fn last_fragment(&self) -> bool {
        self.0 & Self::LAST_FRAGMENT != 0
    }

    pub fn with_reliable(mut self, on: bool) -> Self {
        if on {
            self.0 |= Self::RELIABLE;
        } else {
            self.0 &= !Self::RELIABLE;
        }
        self
    }

    pub fn with_last_fragment(mut self, on: bool) -> Self {
        if on {
            self.0 |= Self::LAST_FRAGMENT;
        } else {
            self.0 &= !Self::LAST_FRAGMENT;
        }
        self
    }
}

// ── Raw header ────────────────────────────────────────────────────────────────

/// The packed wire header. All multi-byte integers are big-endian.
///
/// Wire size: 34 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct RawHeader {
    dst: [u8; 6],
    src: [u8; 6],
    ethertype: U16<BigEndian>,
    kind: u8,
    flags: u8,
    seq: U32<BigEndian>,
    transfer_id: U32<BigEndian>,
    frag_index: U32<BigEndian>,
    frag_total: U32<BigEndian>,
    payload_len: U16<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(RawHeader, [u8; HEADER_SIZE]);

// ── Frame ─────────────────────────────────────────────────────────────────────

/// A decoded frame — the single unit exchanged between peers.
///
/// `transfer_id`, `frag_index`, and `frag_total` are zero for every kind
/// except `File` and `FileAck`. The payload here is cleartext; obfuscation
/// is applied by the codec on the wire side only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub kind: FrameKind,
    pub flags: FrameFlags,
    pub seq: u32,
    pub transfer_id: u32,
    pub frag_index: u32,
    pub frag_total: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Serialize to wire bytes: header, obfuscated payload, trailing CRC-32.
    pub fn encode(&self, key: &[u8]) -> Result<Bytes, WireError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(self.payload.len()));
        }

        let header = RawHeader {
            dst: self.dst.octets(),
            src: self.src.octets(),
            ethertype: U16::new(ETHERTYPE),
            kind: self.kind.into(),
            flags: self.flags.bits(),
            seq: U32::new(self.seq),
            transfer_id: U32::new(self.transfer_id),
            frag_index: U32::new(self.frag_index),
            frag_total: U32::new(self.frag_total),
            payload_len: U16::new(self.payload.len() as u16),
        };

        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len() + CRC_SIZE);
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.payload);
        obfuscate(&mut buf[HEADER_SIZE..], key);

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        Ok(Bytes::from(buf))
    }

    /// Parse wire bytes into a frame.
    ///
    /// The declared payload length is bounded against the buffer before any
    /// payload byte is touched, and the CRC is validated before any field is
    /// handed downstream. Trailing bytes beyond the frame (link-layer
    /// padding) are ignored.
    pub fn decode(raw: &[u8], key: &[u8]) -> Result<Frame, WireError> {
        if raw.len() < HEADER_SIZE + CRC_SIZE {
            return Err(WireError::TooShort(raw.len()));
        }
        let header =
            RawHeader::read_from_prefix(raw).ok_or(WireError::TooShort(raw.len()))?;

        let ethertype = header.ethertype.get();
        if ethertype != ETHERTYPE {
            return Err(WireError::BadEtherType(ethertype));
        }

        let payload_len = header.payload_len.get() as usize;
        let frame_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if raw.len() < frame_len {
            return Err(WireError::Truncated {
                declared: payload_len,
                available: raw.len() - HEADER_SIZE - CRC_SIZE,
            });
        }

        let crc_off = HEADER_SIZE + payload_len;
        let expected = u32::from_be_bytes([
            raw[crc_off],
            raw[crc_off + 1],
            raw[crc_off + 2],
            raw[crc_off + 3],
        ]);
        let actual = crc32fast::hash(&raw[..crc_off]);
        if actual != expected {
            return Err(WireError::CrcMismatch { expected, actual });
        }

        let kind = FrameKind::try_from(header.kind)?;

        let frag_index = header.frag_index.get();
        let frag_total = header.frag_total.get();
        if kind == FrameKind::File && frag_index >= frag_total {
            return Err(WireError::BadFragment {
                index: frag_index,
                total: frag_total,
            });
        }

        let mut payload = raw[HEADER_SIZE..crc_off].to_vec();
        obfuscate(&mut payload, key);

        Ok(Frame {
            dst: MacAddr::new(header.dst),
            src: MacAddr::new(header.src),
            kind,
            flags: FrameFlags::from_bits(header.flags),
            seq: header.seq.get(),
            transfer_id: header.transfer_id.get(),
            frag_index,
            frag_total,
            payload: Bytes::from(payload),
        })
    }

    /// Total wire size of this frame once encoded.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + CRC_SIZE
    }
}

/// Peek at the EtherType field of a raw buffer without decoding.
///
/// Lets the receiver discard foreign traffic before paying for a full parse.
pub fn peek_ethertype(raw: &[u8]) -> Option<u16> {
    if raw.len() < 14 {
        return None;
    }
    Some(u16::from_be_bytes([raw[12], raw[13]]))
}

/// Peek at the destination MAC of a raw buffer without decoding.
pub fn peek_dst(raw: &[u8]) -> Option<MacAddr> {
    let octets: [u8; 6] = raw.get(..6)?.try_into().ok()?;
    Some(MacAddr::new(octets))
}

// ── Obfuscation ───────────────────────────────────────────────────────────────

/// XOR the buffer with a repeating key, starting at key offset 0.
///
/// This is an involution: applying it twice restores the input. It is not
/// confidentiality. An empty key leaves the buffer untouched.
pub fn obfuscate(data: &mut [u8], key: &[u8]) {
    if key.is_empty() {
        return;
    }
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % key.len()];
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when encoding or decoding wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("unexpected ethertype: 0x{0:04x}")]
    BadEtherType(u16),

    #[error("declared payload length {declared} exceeds buffer ({available} available)")]
    Truncated { declared: usize, available: usize },

    #[error("crc mismatch: frame carries 0x{expected:08x}, computed 0x{actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("file fragment index {index} out of range (total {total})")]
    BadFragment { index: u32, total: u32 },

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
