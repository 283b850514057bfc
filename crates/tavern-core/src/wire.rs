//! Tavern wire format: framing shared by every byte on a connection.
//!
//! A connection carries a sequence of frames. Each frame is an 8-byte
//! `FrameHeader` followed by `length` payload bytes. The header tells the
//! receiver what the payload is (handshake, command, asset chunk) and which
//! logical channel it travelled on, before a single payload byte is read.
//!
//! Headers are #[repr(C, packed)] with explicit big-endian integers so the
//! layout is identical on every platform. There is no unsafe code in this
//! module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Precedes every frame on the wire.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Wire format version. Currently 0x01.
    /// A receiver seeing an unknown version skips the frame.
    pub version: u8,

    /// What the payload is. See `FrameKind`.
    pub kind: u8,

    /// Logical channel. See `Channel`.
    pub channel: u8,

    /// Reserved, must be zero.
    pub flags: u8,

    /// Payload length in bytes, not including this header.
    pub length: U32<BigEndian>,
}

assert_eq_size!(FrameHeader, [u8; 8]);

impl FrameHeader {
    pub fn new(kind: FrameKind, channel: Channel, length: usize) -> Result<Self, WireError> {
        if length > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(length));
        }
        Ok(Self {
            version: FRAME_VERSION,
            kind: kind.into(),
            channel: channel.into(),
            flags: 0,
            length: U32::new(length as u32),
        })
    }

    /// Payload length declared by this header.
    pub fn payload_len(&self) -> usize {
        self.length.get() as usize
    }

    /// Check version, kind, channel and flags.
    ///
    /// A header that fails validation still has a usable `payload_len`, so
    /// the reader can skip the payload and stay in sync with the stream.
    pub fn validate(&self) -> Result<(FrameKind, Channel), WireError> {
        if self.version != FRAME_VERSION {
            return Err(WireError::UnknownVersion(self.version));
        }
        if self.flags != 0 {
            return Err(WireError::ReservedFlagsSet(self.flags));
        }
        let kind = FrameKind::try_from(self.kind)?;
        let channel = Channel::try_from(self.channel)?;
        Ok((kind, channel))
    }
}

/// Build a complete frame (header + payload) ready to write.
pub fn encode_frame(kind: FrameKind, channel: Channel, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let header = FrameHeader::new(kind, channel, payload.len())?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

// ── Frame Kind ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// JSON handshake request or response. Only valid before the session is up.
    Handshake = 0x01,
    /// JSON-encoded tagged command.
    Command = 0x02,
    /// Binary asset chunk: `ChunkPrefix`, asset name, payload.
    AssetChunk = 0x03,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Handshake),
            0x02 => Ok(FrameKind::Command),
            0x03 => Ok(FrameKind::AssetChunk),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(k: FrameKind) -> u8 {
        k as u8
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// Logical channel a frame travels on.
///
/// Both channels share one ordered stream, but the writer always drains the
/// Command channel before taking the next Bulk frame. A token-move update is
/// never queued behind a multi-megabyte image, only behind at most one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Latency-sensitive interactive traffic. Never throttled.
    Command = 0x01,

    /// Asset chunks. Rate-limited and interleaved between commands.
    Bulk = 0x02,
}

impl TryFrom<u8> for Channel {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Channel::Command),
            0x02 => Ok(Channel::Bulk),
            other => Err(WireError::UnknownChannel(other)),
        }
    }
}

impl From<Channel> for u8 {
    fn from(c: Channel) -> u8 {
        c as u8
    }
}

// ── Chunk Prefix ──────────────────────────────────────────────────────────────

/// Fixed part of an AssetChunk payload. Followed by `name_len` bytes of
/// UTF-8 asset name, then the chunk data.
///
/// Wire size: 26 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkPrefix {
    /// Sender-assigned transfer identifier, unique per connection.
    pub transfer_id: U64<BigEndian>,

    /// Bytes of the asset delivered so far, including this chunk.
    pub cumulative: U64<BigEndian>,

    /// Total asset size declared by the sender.
    pub total_size: U64<BigEndian>,

    /// Length of the asset name that follows.
    pub name_len: U16<BigEndian>,
}

assert_eq_size!(ChunkPrefix, [u8; 26]);

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current frame format version.
pub const FRAME_VERSION: u8 = 0x01;

pub const FRAME_HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();

pub const CHUNK_PREFIX_SIZE: usize = std::mem::size_of::<ChunkPrefix>();

/// Maximum frame payload. A whole campaign travels in one setCampaign
/// command, so this is generous; anything larger means the stream is corrupt.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Upper bound for a single asset chunk's data.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Default asset chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Default handshake timeout in seconds.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Protocol version exchanged in the handshake. Peers must match exactly.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default host listen port.
pub const DEFAULT_PORT: u16 = 51234;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("unknown channel byte: 0x{0:02x}")]
    UnknownChannel(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_FRAME_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("asset name is not UTF-8")]
    InvalidName,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
