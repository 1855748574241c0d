//! Fixed-width frame codec for single bus transactions.
//!
//! The bus gives us nothing but blind fixed-length byte exchanges, so every
//! transaction carries a self-describing frame: a marker byte, a type tag,
//! a type-specific header, the payload, and zero padding out to the
//! configured transaction size. Chunk frames repeat the total-count field so
//! corruption inside a single transaction is caught at decode time.

use arrayvec::ArrayString;
use static_assertions::const_assert;
use thiserror::Error;

use crate::packet::DataChunk;

/// Leading byte of every well-formed frame. An idle bus reads back as zeros,
/// which can never alias a frame.
pub const FRAME_MARKER: u8 = 0xA5;

/// Smallest transaction width the codec accepts.
pub const MIN_TRANSACTION_SIZE: usize = 32;

/// Maximum diagnostic text carried by a status frame.
pub const MAX_STATUS_DETAIL: usize = 24;

pub const COMMAND_FRAME_LEN: usize = 13;
pub const STATUS_HEADER_LEN: usize = 4;
pub const CHUNK_HEADER_LEN: usize = 10;

const_assert!(COMMAND_FRAME_LEN <= MIN_TRANSACTION_SIZE);
const_assert!(STATUS_HEADER_LEN + MAX_STATUS_DETAIL <= MIN_TRANSACTION_SIZE);
const_assert!(CHUNK_HEADER_LEN < MIN_TRANSACTION_SIZE);

const TAG_COMMAND: u8 = 0x01;
const TAG_STATUS: u8 = 0x02;
const TAG_CHUNK: u8 = 0x03;

// Opcodes on the wire, kept byte-compatible with the deployed rig.
const OP_CAPTURE: u8 = 0x01;
const OP_REQUEST_CHUNK: u8 = 0x02;
const OP_QUERY_READY: u8 = 0x03;

pub type StatusText = ArrayString<MAX_STATUS_DETAIL>;

/// Controller-to-peripheral operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOp {
    /// Begin a capture for the carried session.
    Capture,
    /// Poll whether the peripheral finished capturing.
    QueryReady,
    /// Pull one chunk of the packetized image.
    RequestChunk { index: u16 },
}

/// Result code of a status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Accepted,
    Busy,
    NotReady,
    Ready,
    ChunkUnavailable,
    CaptureFailed,
    Rejected,
}

impl StatusCode {
    fn to_wire(self) -> u8 {
        match self {
            StatusCode::Accepted => 0x01,
            StatusCode::Busy => 0x02,
            StatusCode::NotReady => 0x03,
            StatusCode::Ready => 0x04,
            StatusCode::ChunkUnavailable => 0x05,
            StatusCode::CaptureFailed => 0x06,
            StatusCode::Rejected => 0x07,
        }
    }

    fn from_wire(byte: u8) -> Result<Self, FrameError> {
        match byte {
            0x01 => Ok(StatusCode::Accepted),
            0x02 => Ok(StatusCode::Busy),
            0x03 => Ok(StatusCode::NotReady),
            0x04 => Ok(StatusCode::Ready),
            0x05 => Ok(StatusCode::ChunkUnavailable),
            0x06 => Ok(StatusCode::CaptureFailed),
            0x07 => Ok(StatusCode::Rejected),
            _ => Err(FrameError::Malformed("unknown status code")),
        }
    }
}

/// One logical message exchanged in a single bus transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Command { op: CommandOp, session_id: u64 },
    Status { code: StatusCode, detail: StatusText },
    Chunk(DataChunk),
}

impl Frame {
    pub fn command(op: CommandOp, session_id: u64) -> Self {
        Frame::Command { op, session_id }
    }

    pub fn status(code: StatusCode, detail: &str) -> Self {
        let mut text = StatusText::new();
        // Truncate rather than fail: diagnostics are best-effort.
        for ch in detail.chars() {
            if text.try_push(ch).is_err() {
                break;
            }
        }
        Frame::Status { code, detail: text }
    }

    /// Serializes the frame into exactly `transaction_size` bytes.
    pub fn encode(&self, transaction_size: usize) -> Result<Vec<u8>, FrameError> {
        if transaction_size < MIN_TRANSACTION_SIZE {
            return Err(FrameError::Malformed("transaction size below minimum"));
        }
        let mut buf = vec![0u8; transaction_size];
        buf[0] = FRAME_MARKER;

        match self {
            Frame::Command { op, session_id } => {
                buf[1] = TAG_COMMAND;
                let (opcode, index) = match op {
                    CommandOp::Capture => (OP_CAPTURE, 0u16),
                    CommandOp::QueryReady => (OP_QUERY_READY, 0u16),
                    CommandOp::RequestChunk { index } => (OP_REQUEST_CHUNK, *index),
                };
                buf[2] = opcode;
                buf[3..11].copy_from_slice(&session_id.to_le_bytes());
                buf[11..13].copy_from_slice(&index.to_le_bytes());
            }
            Frame::Status { code, detail } => {
                buf[1] = TAG_STATUS;
                buf[2] = code.to_wire();
                let text = detail.as_bytes();
                buf[3] = text.len() as u8;
                buf[STATUS_HEADER_LEN..STATUS_HEADER_LEN + text.len()].copy_from_slice(text);
            }
            Frame::Chunk(chunk) => {
                if CHUNK_HEADER_LEN + chunk.payload.len() > transaction_size {
                    return Err(FrameError::Malformed("chunk payload exceeds transaction"));
                }
                buf[1] = TAG_CHUNK;
                buf[2..4].copy_from_slice(&chunk.index.to_le_bytes());
                buf[4..6].copy_from_slice(&chunk.total.to_le_bytes());
                buf[6..8].copy_from_slice(&chunk.total.to_le_bytes());
                buf[8..10].copy_from_slice(&(chunk.payload.len() as u16).to_le_bytes());
                buf[CHUNK_HEADER_LEN..CHUNK_HEADER_LEN + chunk.payload.len()]
                    .copy_from_slice(&chunk.payload);
            }
        }

        Ok(buf)
    }

    /// Deserializes one received transaction.
    pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
        if buf.len() < MIN_TRANSACTION_SIZE {
            return Err(FrameError::Malformed("transaction too short"));
        }
        if buf[0] != FRAME_MARKER {
            return Err(FrameError::Malformed("missing frame marker"));
        }

        match buf[1] {
            TAG_COMMAND => {
                let session_id = u64::from_le_bytes(buf[3..11].try_into().unwrap_or_default());
                let index = u16::from_le_bytes([buf[11], buf[12]]);
                let op = match buf[2] {
                    OP_CAPTURE => CommandOp::Capture,
                    OP_QUERY_READY => CommandOp::QueryReady,
                    OP_REQUEST_CHUNK => CommandOp::RequestChunk { index },
                    _ => return Err(FrameError::Malformed("unknown command opcode")),
                };
                Ok(Frame::Command { op, session_id })
            }
            TAG_STATUS => {
                let code = StatusCode::from_wire(buf[2])?;
                let len = buf[3] as usize;
                if len > MAX_STATUS_DETAIL || STATUS_HEADER_LEN + len > buf.len() {
                    return Err(FrameError::Malformed("status detail length out of range"));
                }
                let text = core::str::from_utf8(&buf[STATUS_HEADER_LEN..STATUS_HEADER_LEN + len])
                    .map_err(|_| FrameError::Malformed("status detail not utf-8"))?;
                let mut detail = StatusText::new();
                detail
                    .try_push_str(text)
                    .map_err(|_| FrameError::Malformed("status detail overflow"))?;
                Ok(Frame::Status { code, detail })
            }
            TAG_CHUNK => {
                let index = u16::from_le_bytes([buf[2], buf[3]]);
                let total = u16::from_le_bytes([buf[4], buf[5]]);
                let total_repeat = u16::from_le_bytes([buf[6], buf[7]]);
                if total != total_repeat {
                    return Err(FrameError::Malformed("redundant total-count mismatch"));
                }
                if total == 0 {
                    return Err(FrameError::Malformed("zero total-count"));
                }
                if index >= total {
                    return Err(FrameError::Malformed("chunk index outside total"));
                }
                let len = u16::from_le_bytes([buf[8], buf[9]]) as usize;
                if CHUNK_HEADER_LEN + len > buf.len() {
                    return Err(FrameError::Malformed("chunk payload length out of range"));
                }
                Ok(Frame::Chunk(DataChunk {
                    index,
                    total,
                    payload: buf[CHUNK_HEADER_LEN..CHUNK_HEADER_LEN + len].to_vec(),
                }))
            }
            _ => Err(FrameError::Malformed("unknown frame tag")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}
