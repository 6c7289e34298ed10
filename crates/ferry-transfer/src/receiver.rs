//! Reference receiver: the peer side of the chunk protocol.
//!
//! Reassembles one transfer in memory. Bytes kept from an earlier
//! attempt are offered back to the sender as a resume point.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use ferry_core::digest::ContentDigest;
use ferry_core::wire::{
    decode_meta, Ack, ChunkMeta, Command, ErrorMeta, Frame, FrameMeta, ResumeResponse,
    StartTransfer, StatusMeta, WireError,
};

use crate::plan::TransferPlan;
use crate::transport::{FrameTransport, TransportError};

/// Largest transfer a receiver accepts unless told otherwise.
pub const DEFAULT_MAX_RECEIVE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Upper bound on the buffer reserved up front; the rest grows per chunk.
const INITIAL_CAPACITY_LIMIT: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed frame: {0}")]
    Malformed(#[from] WireError),

    #[error("invalid START_TRANSFER: {0}")]
    InvalidStart(String),

    #[error("unexpected {0} frame")]
    UnexpectedFrame(String),

    #[error("frame for transfer {actual:?} while receiving {expected:?}")]
    TransferIdMismatch { expected: String, actual: String },

    #[error("expected chunk {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("COMPLETE after {got} of {expected} bytes")]
    Incomplete { expected: u64, got: u64 },

    #[error("whole-stream digest mismatch")]
    FileDigestMismatch,

    #[error("sender aborted: {0}")]
    SenderAborted(String),

    #[error("connection closed mid-transfer")]
    ConnectionClosed,
}

/// A transfer reassembled and verified end to end.
#[derive(Debug, Clone)]
pub struct ReceivedTransfer {
    pub transfer_id: String,
    pub data: Bytes,
    pub file_digest: String,
    /// Chunk index the sender was asked to resume from.
    pub resumed_from: u64,
    /// Chunks that failed digest verification and were nacked.
    pub rejected_chunks: u64,
}

pub struct ChunkReceiver {
    transport: Arc<dyn FrameTransport>,
    digest: Arc<dyn ContentDigest>,
    existing: Vec<u8>,
    max_bytes: u64,
}

struct Assembly {
    plan: TransferPlan,
    data: BytesMut,
    next_index: u64,
    resumed_from: u64,
    rejected: u64,
}

impl ChunkReceiver {
    pub fn new(transport: Arc<dyn FrameTransport>, digest: Arc<dyn ContentDigest>) -> Self {
        Self {
            transport,
            digest,
            existing: Vec::new(),
            max_bytes: DEFAULT_MAX_RECEIVE_BYTES,
        }
    }

    /// Refuse transfers announcing more than `max_bytes`.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Bytes confirmed by an earlier attempt. Only whole chunks count; a
    /// trailing partial chunk is discarded when the transfer starts.
    pub fn with_existing(mut self, existing: Vec<u8>) -> Self {
        self.existing = existing;
        self
    }

    /// Receive one transfer.
    pub async fn receive(self) -> Result<ReceivedTransfer, ReceiveError> {
        let start = match self.next_meta().await? {
            FrameMeta::Command(Command::StartTransfer(start)) => start,
            other => return Err(ReceiveError::UnexpectedFrame(describe(&other))),
        };
        let transfer_id = start.transfer_id.clone();
        let mut assembly = match self.open(start).await {
            Ok(assembly) => assembly,
            Err(err @ ReceiveError::InvalidStart(_)) => {
                self.abort(&transfer_id, &err).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        loop {
            let raw = self
                .transport
                .receive_frame()
                .await?
                .ok_or(ReceiveError::ConnectionClosed)?;
            let frame = Frame::decode(raw)?;

            match frame.meta {
                FrameMeta::Command(Command::Chunk(meta)) => {
                    self.accept_chunk(&mut assembly, meta, frame.payload).await?;
                }
                FrameMeta::Command(Command::Complete(complete)) => {
                    self.check_id(&assembly, &complete.transfer_id)?;
                    return self.finish(assembly, complete.file_digest);
                }
                FrameMeta::Command(Command::Error(e)) => {
                    tracing::warn!(
                        transfer_id = %assembly.plan.transfer_id,
                        reason = %e.reason,
                        "sender aborted transfer"
                    );
                    return Err(ReceiveError::SenderAborted(e.reason));
                }
                other => {
                    let err = ReceiveError::UnexpectedFrame(describe(&other));
                    self.abort(&assembly.plan.transfer_id, &err).await;
                    return Err(err);
                }
            }
        }
    }

    async fn next_meta(&self) -> Result<FrameMeta, ReceiveError> {
        let raw = self
            .transport
            .receive_frame()
            .await?
            .ok_or(ReceiveError::ConnectionClosed)?;
        let (meta, _) = decode_meta(&raw)?;
        Ok(meta)
    }

    /// Validate the plan and answer with OK or a resume point.
    async fn open(&self, start: StartTransfer) -> Result<Assembly, ReceiveError> {
        let plan = TransferPlan::new(start.transfer_id, start.total_bytes, start.chunk_size)
            .map_err(|e| ReceiveError::InvalidStart(e.to_string()))?;
        if plan.total_chunks != start.total_chunks {
            return Err(ReceiveError::InvalidStart(format!(
                "{} chunks announced, plan needs {}",
                start.total_chunks, plan.total_chunks
            )));
        }
        let total_bytes = usize::try_from(plan.total_bytes)
            .ok()
            .filter(|_| plan.total_bytes <= self.max_bytes)
            .ok_or_else(|| {
                ReceiveError::InvalidStart(format!(
                    "{} bytes announced, limit is {}",
                    plan.total_bytes, self.max_bytes
                ))
            })?;

        let whole_chunks = if self.existing.len() as u64 > plan.total_bytes {
            tracing::warn!(
                transfer_id = %plan.transfer_id,
                held = self.existing.len(),
                "held bytes exceed announced size, starting over"
            );
            0
        } else {
            self.existing.len() as u64 / u64::from(plan.chunk_size)
        };
        let kept = plan.bytes_through(whole_chunks) as usize;

        let mut data = BytesMut::with_capacity(total_bytes.min(INITIAL_CAPACITY_LIMIT));
        data.extend_from_slice(&self.existing[..kept]);

        let reply: FrameMeta = if whole_chunks > 0 {
            Command::ResumeResponse(ResumeResponse {
                transfer_id: plan.transfer_id.clone(),
                last_confirmed_chunk: whole_chunks,
            })
            .into()
        } else {
            StatusMeta::ok().into()
        };
        self.transport.send_frame(Frame::control(reply).encode()?).await?;

        tracing::info!(
            transfer_id = %plan.transfer_id,
            chunks = plan.total_chunks,
            resume_from = whole_chunks,
            "accepted transfer"
        );

        Ok(Assembly {
            plan,
            data,
            next_index: whole_chunks,
            resumed_from: whole_chunks,
            rejected: 0,
        })
    }

    async fn accept_chunk(
        &self,
        assembly: &mut Assembly,
        meta: ChunkMeta,
        payload: Bytes,
    ) -> Result<(), ReceiveError> {
        self.check_id(assembly, &meta.transfer_id)?;
        let index = meta.chunk_index;
        if index != assembly.next_index || index >= assembly.plan.total_chunks {
            let err = ReceiveError::OutOfOrder {
                expected: assembly.next_index,
                got: index,
            };
            self.abort(&assembly.plan.transfer_id, &err).await;
            return Err(err);
        }

        let verdict = if payload.len() != assembly.plan.chunk_length(index) {
            Err("length mismatch")
        } else if !self.digest.verify(&payload, &meta.digest) {
            Err("digest mismatch")
        } else {
            Ok(())
        };

        let ack = match verdict {
            Ok(()) => {
                assembly.data.extend_from_slice(&payload);
                assembly.next_index += 1;
                tracing::debug!(transfer_id = %meta.transfer_id, chunk = index, "chunk stored");
                Ack {
                    transfer_id: meta.transfer_id,
                    chunk_index: index,
                    success: true,
                    reason: None,
                }
            }
            Err(reason) => {
                assembly.rejected += 1;
                tracing::warn!(transfer_id = %meta.transfer_id, chunk = index, reason, "chunk rejected");
                Ack {
                    transfer_id: meta.transfer_id,
                    chunk_index: index,
                    success: false,
                    reason: Some(reason.to_string()),
                }
            }
        };
        let frame = Frame::control(Command::Ack(ack)).encode()?;
        self.transport.send_frame(frame).await?;
        Ok(())
    }

    fn finish(&self, assembly: Assembly, file_digest: String) -> Result<ReceivedTransfer, ReceiveError> {
        let got = assembly.data.len() as u64;
        if got != assembly.plan.total_bytes {
            return Err(ReceiveError::Incomplete {
                expected: assembly.plan.total_bytes,
                got,
            });
        }
        if !self.digest.verify(&assembly.data, &file_digest) {
            return Err(ReceiveError::FileDigestMismatch);
        }
        tracing::info!(transfer_id = %assembly.plan.transfer_id, bytes = got, "transfer received");
        Ok(ReceivedTransfer {
            transfer_id: assembly.plan.transfer_id,
            data: assembly.data.freeze(),
            file_digest,
            resumed_from: assembly.resumed_from,
            rejected_chunks: assembly.rejected,
        })
    }

    fn check_id(&self, assembly: &Assembly, actual: &str) -> Result<(), ReceiveError> {
        if actual == assembly.plan.transfer_id {
            return Ok(());
        }
        Err(ReceiveError::TransferIdMismatch {
            expected: assembly.plan.transfer_id.clone(),
            actual: actual.to_string(),
        })
    }

    /// Tell the sender we are giving up. Delivery is best effort.
    async fn abort(&self, transfer_id: &str, err: &ReceiveError) {
        let notice = Command::Error(ErrorMeta {
            transfer_id: transfer_id.to_string(),
            reason: err.to_string(),
        });
        let sent = match Frame::control(notice).encode() {
            Ok(frame) => self.transport.send_frame(frame).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = sent {
            tracing::warn!(%transfer_id, error = %e, "could not send ERROR frame");
        }
    }
}

fn describe(meta: &FrameMeta) -> String {
    match meta {
        FrameMeta::Command(c) => c.name().to_string(),
        FrameMeta::Status(_) => "status".to_string(),
    }
}
