//! ferry-transfer: the chunked transfer engine.
//!
//! A sender splits a byte stream into fixed-size chunks, paces them under
//! a bounded in-flight window, matches asynchronous acknowledgments back
//! to their chunks, and closes with a whole-stream digest. A receiver
//! that speaks the same protocol lives in [`receiver`].

pub mod ack_reader;
pub mod engine;
pub mod error;
pub mod negotiate;
pub mod pending;
pub mod plan;
pub mod progress;
pub mod receiver;
pub mod transport;

pub use engine::{ChunkedTransferEngine, TransferReport};
pub use error::{TransferError, TransferFailure, ValidationError};
pub use plan::{ChunkDescriptor, PlanError, TransferPlan};
pub use progress::{ChannelProgress, ProgressSink, TransferProgress};
pub use receiver::{ChunkReceiver, ReceiveError, ReceivedTransfer};
pub use transport::{FrameTransport, MemoryTransport, StreamTransport, TransportError};
