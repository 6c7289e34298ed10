//! Ferry wire format: the self-describing frame every peer exchanges.
//!
//! ```text
//! [0..4)               meta_len, unsigned 32-bit little-endian
//! [4..4+meta_len)      UTF-8 JSON meta object
//! [4+meta_len..end)    raw chunk payload (CHUNK frames only)
//! ```
//!
//! The meta object is tagged by a `commandType` discriminator, except for
//! the generic `{ "status": ... }` reply a peer may send during
//! negotiation. The codec does not cross-check the payload length against
//! any meta field: the transport delivers exactly one frame per call, so
//! the frame boundary is the payload boundary.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Length of the little-endian meta length prefix.
pub const META_PREFIX_LEN: usize = 4;

/// Chunk payload size. Every chunk but the last is exactly this long.
pub const DEFAULT_CHUNK_SIZE: u32 = 256 * 1024;

/// Maximum number of chunks sent but not yet acknowledged.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Seconds a chunk may wait for its acknowledgment.
pub const DEFAULT_ACK_TIMEOUT_SECS: u64 = 30;

/// Status value of a generic "go ahead" reply to START_TRANSFER.
pub const STATUS_OK: &str = "OK";

/// JSON field carrying the meta discriminator.
pub const COMMAND_TYPE_FIELD: &str = "commandType";

// ── Meta variants ─────────────────────────────────────────────────────────────

/// Opens a transfer. Sent once, before any chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransfer {
    pub transfer_id: String,
    pub total_bytes: u64,
    pub total_chunks: u64,
    pub chunk_size: u32,
}

/// Describes the payload that follows it in the same frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    pub transfer_id: String,
    pub chunk_index: u64,
    /// Content digest of the payload bytes. The receiver recomputes it
    /// and rejects the chunk on mismatch.
    #[serde(alias = "sha256")]
    pub digest: String,
}

/// Closes a transfer with the digest of the entire stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Complete {
    pub transfer_id: String,
    #[serde(alias = "fileSha256")]
    pub file_digest: String,
}

/// Either side abandons the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMeta {
    #[serde(default)]
    pub transfer_id: String,
    #[serde(default)]
    pub reason: String,
}

/// Receiver verdict on one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub transfer_id: String,
    pub chunk_index: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Receiver already holds chunks `0..last_confirmed_chunk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub transfer_id: String,
    pub last_confirmed_chunk: u64,
}

/// Untagged reply used by peers that only acknowledge START_TRANSFER.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMeta {
    pub status: String,
}

impl StatusMeta {
    pub fn ok() -> Self {
        Self {
            status: STATUS_OK.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Every tagged meta object, discriminated by `commandType`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "commandType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    StartTransfer(StartTransfer),
    Chunk(ChunkMeta),
    Complete(Complete),
    Error(ErrorMeta),
    Ack(Ack),
    ResumeResponse(ResumeResponse),
}

impl Command {
    /// Discriminator values, in declaration order.
    pub const NAMES: [&'static str; 6] = [
        "START_TRANSFER",
        "CHUNK",
        "COMPLETE",
        "ERROR",
        "ACK",
        "RESUME_RESPONSE",
    ];

    /// The `commandType` this variant serializes with.
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartTransfer(_) => "START_TRANSFER",
            Command::Chunk(_) => "CHUNK",
            Command::Complete(_) => "COMPLETE",
            Command::Error(_) => "ERROR",
            Command::Ack(_) => "ACK",
            Command::ResumeResponse(_) => "RESUME_RESPONSE",
        }
    }

    pub fn transfer_id(&self) -> &str {
        match self {
            Command::StartTransfer(m) => &m.transfer_id,
            Command::Chunk(m) => &m.transfer_id,
            Command::Complete(m) => &m.transfer_id,
            Command::Error(m) => &m.transfer_id,
            Command::Ack(m) => &m.transfer_id,
            Command::ResumeResponse(m) => &m.transfer_id,
        }
    }
}

/// The JSON block of a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FrameMeta {
    Command(Command),
    Status(StatusMeta),
}

impl FrameMeta {
    /// Parse a meta block. The discriminator is inspected before any
    /// field validation so an unknown command is reported as such rather
    /// than as a missing field.
    pub fn from_json(bytes: &[u8]) -> Result<Self, WireError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| WireError::InvalidJson(e.to_string()))?;

        let tag = match value.as_object() {
            Some(map) => map.get(COMMAND_TYPE_FIELD).cloned(),
            None => return Err(WireError::NotAnObject),
        };

        match tag {
            Some(serde_json::Value::String(tag)) => {
                if !Command::NAMES.contains(&tag.as_str()) {
                    return Err(WireError::UnknownCommand(tag));
                }
                serde_json::from_value::<Command>(value)
                    .map(FrameMeta::Command)
                    .map_err(|e| WireError::InvalidMeta {
                        command: tag,
                        message: e.to_string(),
                    })
            }
            Some(other) => Err(WireError::InvalidMeta {
                command: COMMAND_TYPE_FIELD.to_string(),
                message: format!("expected a string, got {other}"),
            }),
            None => serde_json::from_value::<StatusMeta>(value)
                .map(FrameMeta::Status)
                .map_err(|e| WireError::InvalidMeta {
                    command: "status".to_string(),
                    message: e.to_string(),
                }),
        }
    }

    pub fn as_command(&self) -> Option<&Command> {
        match self {
            FrameMeta::Command(c) => Some(c),
            FrameMeta::Status(_) => None,
        }
    }
}

impl From<Command> for FrameMeta {
    fn from(command: Command) -> Self {
        FrameMeta::Command(command)
    }
}

impl From<StatusMeta> for FrameMeta {
    fn from(status: StatusMeta) -> Self {
        FrameMeta::Status(status)
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One wire unit: meta plus an optional raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub meta: FrameMeta,
    pub payload: Bytes,
}

impl Frame {
    /// A frame with no payload.
    pub fn control(meta: impl Into<FrameMeta>) -> Self {
        Self {
            meta: meta.into(),
            payload: Bytes::new(),
        }
    }

    /// A CHUNK frame carrying `payload`.
    pub fn chunk(meta: ChunkMeta, payload: Bytes) -> Self {
        Self {
            meta: FrameMeta::Command(Command::Chunk(meta)),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        encode(&self.meta, &self.payload)
    }

    /// Split `buf` into meta and payload. The payload shares `buf`'s
    /// allocation.
    pub fn decode(buf: Bytes) -> Result<Self, WireError> {
        let (meta, meta_end) = decode_meta(&buf)?;
        Ok(Self {
            meta,
            payload: buf.slice(meta_end..),
        })
    }
}

/// Serialize `meta`, prefix its length, and append `payload`.
pub fn encode(meta: &FrameMeta, payload: &[u8]) -> Result<Bytes, WireError> {
    let json = serde_json::to_vec(meta).map_err(|e| WireError::InvalidJson(e.to_string()))?;
    let meta_len = u32::try_from(json.len()).map_err(|_| WireError::MetaTooLarge(json.len()))?;

    let mut out = BytesMut::with_capacity(META_PREFIX_LEN + json.len() + payload.len());
    out.put_u32_le(meta_len);
    out.put_slice(&json);
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Parse the meta block of `buf`, returning it with the offset at which the
/// payload begins.
pub fn decode_meta(buf: &[u8]) -> Result<(FrameMeta, usize), WireError> {
    if buf.len() < META_PREFIX_LEN {
        return Err(WireError::Truncated(buf.len()));
    }
    let mut prefix = [0u8; META_PREFIX_LEN];
    prefix.copy_from_slice(&buf[..META_PREFIX_LEN]);
    let meta_len = u32::from_le_bytes(prefix) as usize;

    if meta_len == 0 {
        return Err(WireError::EmptyMeta);
    }
    let meta_end = META_PREFIX_LEN
        .checked_add(meta_len)
        .filter(|end| *end <= buf.len())
        .ok_or(WireError::MetaOverrun {
            declared: meta_len,
            available: buf.len() - META_PREFIX_LEN,
        })?;

    let meta = FrameMeta::from_json(&buf[META_PREFIX_LEN..meta_end])?;
    Ok((meta, meta_end))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame of {0} bytes is shorter than the meta length prefix")]
    Truncated(usize),

    #[error("frame declares an empty meta block")]
    EmptyMeta,

    #[error("meta length {declared} exceeds the {available} bytes that follow the prefix")]
    MetaOverrun { declared: usize, available: usize },

    #[error("meta is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("meta is not a JSON object")]
    NotAnObject,

    #[error("unknown commandType {0:?}")]
    UnknownCommand(String),

    #[error("invalid {command} meta: {message}")]
    InvalidMeta { command: String, message: String },

    #[error("meta of {0} bytes does not fit a 32-bit length prefix")]
    MetaTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
