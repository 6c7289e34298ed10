//! Error types for the transfer engine.

use std::sync::Arc;

use ferry_core::config::ConfigError;
use ferry_core::wire::WireError;

use crate::plan::PlanError;
use crate::transport::TransportError;

/// A single transfer fault.
///
/// Cloneable so one fault can resolve every outstanding chunk signal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    /// Peer answered START_TRANSFER with ERROR.
    #[error("peer refused transfer: {0}")]
    NegotiationRefused(String),

    /// Peer claims to hold more chunks than the plan has.
    #[error("peer resume point {resume_from} exceeds chunk count {total_chunks}")]
    InvalidResumePoint { resume_from: u64, total_chunks: u64 },

    #[error("stream ended prematurely at chunk {index} (got {got}/{expected} bytes)")]
    PrematureStreamEnd {
        index: u64,
        got: usize,
        expected: usize,
    },

    #[error("failed to read source stream: {0}")]
    Source(Arc<std::io::Error>),

    #[error("no acknowledgment for chunk {index} within {secs}s")]
    AckTimeout { index: u64, secs: u64 },

    /// Peer sent ERROR while chunks were in flight.
    #[error("peer reported error: {0}")]
    AgentRejected(String),

    #[error("chunk {index} rejected: {reason}")]
    ChunkRejected { index: u64, reason: String },

    #[error("transfer id mismatch: expected {expected:?}, got {actual:?}")]
    TransferIdMismatch { expected: String, actual: String },

    /// Ack for an index that is not pending: duplicate, late, or never sent.
    #[error("acknowledgment for unknown chunk {0}")]
    UnknownAck(u64),

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] WireError),

    #[error("unexpected {0} frame")]
    UnexpectedFrame(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("transfer cancelled")]
    Cancelled,
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Source(Arc::new(e))
    }
}

/// A send request refused before any I/O.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Settings(#[from] ConfigError),
}

/// Where a failed transfer went wrong, as seen by the caller.
#[derive(Debug, thiserror::Error)]
pub enum TransferFailure {
    /// Rejected before any I/O.
    #[error("invalid transfer request: {0}")]
    Validation(#[source] ValidationError),

    #[error("negotiation failed: {0}")]
    Negotiation(#[source] TransferError),

    /// Fault raised on the send path: source reads, frame writes, ack
    /// deadlines, or caller cancellation.
    #[error("transfer failed in send path: {0}")]
    Send(#[source] TransferError),

    /// Fault raised while processing acknowledgments.
    #[error("transfer failed in ack reader: {0}")]
    Reader(#[source] TransferError),
}

impl TransferFailure {
    /// The underlying fault, if the request got as far as I/O.
    pub fn cause(&self) -> Option<&TransferError> {
        match self {
            TransferFailure::Validation(_) => None,
            TransferFailure::Negotiation(e)
            | TransferFailure::Send(e)
            | TransferFailure::Reader(e) => Some(e),
        }
    }

    pub fn is_reader_fault(&self) -> bool {
        matches!(self, TransferFailure::Reader(_))
    }
}
