//! Ack reader: drains receiver verdicts and resolves pending chunks.

use ferry_core::wire::{decode_meta, Command, FrameMeta};
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;
use crate::pending::PendingAcks;
use crate::transport::FrameTransport;

pub struct AckReader<'a> {
    transport: &'a dyn FrameTransport,
    pending: PendingAcks,
    transfer_id: &'a str,
    /// Acks still owed by the receiver.
    remaining: u64,
    cancel: CancellationToken,
}

impl<'a> AckReader<'a> {
    pub fn new(
        transport: &'a dyn FrameTransport,
        pending: PendingAcks,
        transfer_id: &'a str,
        expected_acks: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            pending,
            transfer_id,
            remaining: expected_acks,
            cancel,
        }
    }

    /// Read until every expected ack has arrived.
    ///
    /// Returns `Ok` early if cancelled; whoever cancelled owns the fault.
    /// A rejected chunk resolves its pending entry with the rejection
    /// before the error is returned.
    pub async fn run(mut self) -> Result<(), TransferError> {
        while self.remaining > 0 {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                frame = self.transport.receive_frame() => frame?,
            };
            let frame = frame.ok_or(TransferError::ConnectionClosed)?;
            let (meta, _) = decode_meta(&frame)?;
            self.handle(meta)?;
        }
        tracing::debug!(transfer_id = %self.transfer_id, "all acknowledgments received");
        Ok(())
    }

    fn handle(&mut self, meta: FrameMeta) -> Result<(), TransferError> {
        let ack = match meta {
            FrameMeta::Command(Command::Ack(ack)) => ack,
            FrameMeta::Command(Command::Error(e)) => {
                return Err(TransferError::AgentRejected(e.reason));
            }
            FrameMeta::Command(other) => {
                return Err(TransferError::UnexpectedFrame(other.name().to_string()));
            }
            FrameMeta::Status(_) => {
                return Err(TransferError::UnexpectedFrame("status".to_string()));
            }
        };

        if ack.transfer_id != self.transfer_id {
            return Err(TransferError::TransferIdMismatch {
                expected: self.transfer_id.to_string(),
                actual: ack.transfer_id,
            });
        }

        let index = ack.chunk_index;
        if ack.success {
            if !self.pending.resolve(index, Ok(())) {
                return Err(TransferError::UnknownAck(index));
            }
            tracing::debug!(transfer_id = %self.transfer_id, chunk = index, "chunk acknowledged");
            self.remaining -= 1;
            return Ok(());
        }

        let rejection = TransferError::ChunkRejected {
            index,
            reason: ack.reason.unwrap_or_else(|| "no reason given".to_string()),
        };
        if !self.pending.resolve(index, Err(rejection.clone())) {
            return Err(TransferError::UnknownAck(index));
        }
        Err(rejection)
    }
}
