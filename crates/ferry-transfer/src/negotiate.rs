//! Start-of-transfer handshake.
//!
//! The sender announces the plan, then reads exactly one reply:
//!   RESUME_RESPONSE  → resume from `lastConfirmedChunk`
//!   ERROR            → the peer refuses the transfer
//!   {"status":"OK"}  → fresh start
//!   anything else    → fresh start, with a warning
//!
//! The last rule is fail-open on purpose: peers that predate resume
//! support reply with arbitrary acknowledgments, and a fresh start is
//! always correct, only slower.

use ferry_core::wire::{decode_meta, Command, Frame, FrameMeta};

use crate::error::TransferError;
use crate::plan::TransferPlan;
use crate::transport::FrameTransport;

/// Send START_TRANSFER and return the chunk index to send from.
pub async fn negotiate(
    transport: &dyn FrameTransport,
    plan: &TransferPlan,
) -> Result<u64, TransferError> {
    let start = Frame::control(Command::StartTransfer(plan.start_meta())).encode()?;
    transport.send_frame(start).await?;

    tracing::debug!(
        transfer_id = %plan.transfer_id,
        chunks = plan.total_chunks,
        bytes = plan.total_bytes,
        "START_TRANSFER sent"
    );

    let reply = transport
        .receive_frame()
        .await?
        .ok_or(TransferError::ConnectionClosed)?;

    let resume_from = match decode_meta(&reply) {
        Ok((FrameMeta::Command(Command::ResumeResponse(resume)), _)) => {
            if resume.transfer_id != plan.transfer_id {
                return Err(TransferError::TransferIdMismatch {
                    expected: plan.transfer_id.clone(),
                    actual: resume.transfer_id,
                });
            }
            tracing::info!(
                transfer_id = %plan.transfer_id,
                resume_from = resume.last_confirmed_chunk,
                "peer requested resume"
            );
            resume.last_confirmed_chunk
        }
        Ok((FrameMeta::Command(Command::Error(refusal)), _)) => {
            return Err(TransferError::NegotiationRefused(refusal.reason));
        }
        Ok((FrameMeta::Status(status), _)) if status.is_ok() => 0,
        Ok((meta, _)) => {
            tracing::warn!(
                transfer_id = %plan.transfer_id,
                reply = ?meta,
                "unexpected negotiation reply, assuming fresh start"
            );
            0
        }
        Err(e) => {
            tracing::warn!(
                transfer_id = %plan.transfer_id,
                error = %e,
                "unreadable negotiation reply, assuming fresh start"
            );
            0
        }
    };

    if resume_from > plan.total_chunks {
        return Err(TransferError::InvalidResumePoint {
            resume_from,
            total_chunks: plan.total_chunks,
        });
    }
    Ok(resume_from)
}
