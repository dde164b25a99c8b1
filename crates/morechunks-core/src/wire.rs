//! MoreChunks wire format: every message exchanged with a client.
//!
//! A message is one tag byte followed by a tag-specific payload. Where a
//! message ends is the transport's business; this module only ever sees
//! complete messages.
//!
//! Chunk positions travel as two big-endian i32s. [`PositionWire`] is the
//! zerocopy view of those eight bytes. There is no unsafe code in this module.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, I32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Tags ─────────────────────────────────────────────────────────────────────

/// Message tag bytes. The same values are used in both directions.
pub mod tag {
    /// Client → server: chunk upload. Server → client: chunk delivery.
    pub const CHUNK: u8 = 0x00;
    /// Key/value text in either direction.
    pub const INFO: u8 = 0x01;
    /// Client → server: list of positions the client wants back.
    pub const CHUNKS_REQUEST: u8 = 0x02;
}

/// Info keys the server understands. Everything else is ignored.
pub mod info_key {
    pub const DIMENSION: &str = "game.dimension=";
    pub const CHUNKS_PER_SECOND: &str = "mod.chunksPerSecond=";
    pub const VERSION: &str = "mod.version=";
}

/// Bytes of client timestamp at the front of every upload. Not interpreted.
pub const UPLOAD_TIMESTAMP_LEN: usize = 8;

/// Wire size of one encoded position.
pub const POSITION_LEN: usize = 8;

/// Sent once, right after a connection is accepted.
pub const HANDSHAKE_TEXT: &str = "! serverRenderDistance=4";

// ── Positions ────────────────────────────────────────────────────────────────

/// Identifies one chunk column. Also the storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPosition {
    pub cx: i32,
    pub cz: i32,
}

impl ChunkPosition {
    pub const fn new(cx: i32, cz: i32) -> Self {
        Self { cx, cz }
    }

    pub fn to_wire(self) -> PositionWire {
        PositionWire {
            cx: I32::new(self.cx),
            cz: I32::new(self.cz),
        }
    }
}

impl fmt::Display for ChunkPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.cx, self.cz)
    }
}

/// On-wire layout of a [`ChunkPosition`].
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PositionWire {
    pub cx: I32<BigEndian>,
    pub cz: I32<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(PositionWire, [u8; POSITION_LEN]);

impl From<PositionWire> for ChunkPosition {
    fn from(wire: PositionWire) -> Self {
        Self::new(wire.cx.get(), wire.cz.get())
    }
}

// ── Inbound ──────────────────────────────────────────────────────────────────

/// Recognised info messages. The value is kept as the raw text after the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoMessage {
    Dimension(String),
    ChunksPerSecond(String),
    Version(String),
    /// Any text without a recognised key prefix.
    Other(String),
}

impl InfoMessage {
    pub fn parse(text: &str) -> Self {
        if let Some(v) = text.strip_prefix(info_key::DIMENSION) {
            Self::Dimension(v.to_string())
        } else if let Some(v) = text.strip_prefix(info_key::CHUNKS_PER_SECOND) {
            Self::ChunksPerSecond(v.to_string())
        } else if let Some(v) = text.strip_prefix(info_key::VERSION) {
            Self::Version(v.to_string())
        } else {
            Self::Other(text.to_string())
        }
    }
}

/// A decoded client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPacket {
    /// `blob` starts with the position bytes; only the timestamp is stripped.
    Upload {
        position: ChunkPosition,
        blob: Bytes,
    },
    Info(InfoMessage),
    /// `trailing_bytes` counts payload bytes past the last whole position.
    /// They are dropped, not rejected.
    ChunksRequest {
        positions: Vec<ChunkPosition>,
        trailing_bytes: usize,
    },
    Unknown {
        tag: u8,
        payload: Bytes,
    },
}

/// Split a complete message into tag and payload, then decode.
pub fn decode_message(message: Bytes) -> Result<InboundPacket, WireError> {
    let Some(&tag) = message.first() else {
        return Err(WireError::EmptyMessage);
    };
    decode(tag, message.slice(1..))
}

/// Decode a payload for the given tag. Only uploads can fail.
pub fn decode(tag: u8, payload: Bytes) -> Result<InboundPacket, WireError> {
    match tag {
        tag::CHUNK => decode_upload(payload),
        tag::INFO => Ok(InboundPacket::Info(InfoMessage::parse(
            &String::from_utf8_lossy(&payload),
        ))),
        tag::CHUNKS_REQUEST => Ok(decode_chunks_request(&payload)),
        other => Ok(InboundPacket::Unknown {
            tag: other,
            payload,
        }),
    }
}

fn decode_upload(payload: Bytes) -> Result<InboundPacket, WireError> {
    let required = UPLOAD_TIMESTAMP_LEN + POSITION_LEN;
    let too_short = WireError::UploadTooShort {
        actual: payload.len(),
        required,
    };
    if payload.len() < required {
        return Err(too_short);
    }

    let blob = payload.slice(UPLOAD_TIMESTAMP_LEN..);
    let position = PositionWire::read_from_prefix(&blob[..])
        .map(ChunkPosition::from)
        .ok_or(too_short)?;

    Ok(InboundPacket::Upload { position, blob })
}

fn decode_chunks_request(payload: &[u8]) -> InboundPacket {
    let groups = payload.chunks_exact(POSITION_LEN);
    let trailing_bytes = groups.remainder().len();
    let positions = groups
        .filter_map(PositionWire::read_from)
        .map(ChunkPosition::from)
        .collect();
    InboundPacket::ChunksRequest {
        positions,
        trailing_bytes,
    }
}

// ── Outbound ─────────────────────────────────────────────────────────────────

/// `0x00 ++ blob ++ 0x00`.
pub fn encode_chunk_frame(blob: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(blob.len() + 2);
    buf.put_u8(tag::CHUNK);
    buf.put_slice(blob);
    buf.put_u8(0);
    buf.freeze()
}

/// `0x01 ++ text`.
pub fn encode_info_frame(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 1);
    buf.put_u8(tag::INFO);
    buf.put_slice(text.as_bytes());
    buf.freeze()
}

/// A decoded server message, as a client sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Stored blob, position bytes included, terminator removed.
    Chunk(Bytes),
    Info(String),
}

impl ServerFrame {
    pub fn decode(message: Bytes) -> Result<Self, WireError> {
        match message.first() {
            None => Err(WireError::EmptyMessage),
            Some(&tag::CHUNK) => {
                if message.len() < 2 || message[message.len() - 1] != 0 {
                    return Err(WireError::MissingTerminator);
                }
                Ok(Self::Chunk(message.slice(1..message.len() - 1)))
            }
            Some(&tag::INFO) => Ok(Self::Info(
                String::from_utf8_lossy(&message[1..]).into_owned(),
            )),
            Some(&other) => Err(WireError::UnknownServerTag(other)),
        }
    }

    pub fn position(&self) -> Option<ChunkPosition> {
        match self {
            Self::Chunk(blob) => PositionWire::read_from_prefix(&blob[..]).map(Into::into),
            Self::Info(_) => None,
        }
    }
}

// ── Client-side encoders ─────────────────────────────────────────────────────

/// Full upload message: tag, timestamp, position, chunk data.
pub fn encode_upload(timestamp: u64, position: ChunkPosition, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + UPLOAD_TIMESTAMP_LEN + POSITION_LEN + data.len());
    buf.put_u8(tag::CHUNK);
    buf.put_u64(timestamp);
    buf.put_slice(position.to_wire().as_bytes());
    buf.put_slice(data);
    buf.freeze()
}

/// Full chunks-request message for the given positions, in order.
pub fn encode_chunks_request(positions: &[ChunkPosition]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + positions.len() * POSITION_LEN);
    buf.put_u8(tag::CHUNKS_REQUEST);
    for p in positions {
        buf.put_slice(p.to_wire().as_bytes());
    }
    buf.freeze()
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty message")]
    EmptyMessage,

    #[error("upload payload is {actual} bytes, need at least {required}")]
    UploadTooShort { actual: usize, required: usize },

    #[error("chunk frame missing zero terminator")]
    MissingTerminator,

    #[error("unknown server tag: 0x{0:02x}")]
    UnknownServerTag(u8),
}

// ── Tests ────────────────────────────────────────────────────────────────────
