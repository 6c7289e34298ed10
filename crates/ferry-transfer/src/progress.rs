//! Progress snapshots emitted while a transfer runs.

use serde::Serialize;
use tokio::sync::mpsc;

/// Point-in-time view of a transfer. Emitted after every successful
/// acknowledgment and once more on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: String,
    pub confirmed_chunks: u64,
    pub total_chunks: u64,
    pub confirmed_bytes: u64,
    pub total_bytes: u64,
    pub is_complete: bool,
}

impl TransferProgress {
    /// Fraction of bytes confirmed, 1.0 for an empty transfer.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.confirmed_bytes as f64 / self.total_bytes as f64
    }
}

/// Receives progress snapshots.
///
/// Called synchronously from the task that resolved the chunk, so
/// implementations should return quickly.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: TransferProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(TransferProgress) + Send + Sync,
{
    fn report(&self, progress: TransferProgress) {
        self(progress)
    }
}

/// Forwards snapshots into an unbounded channel.
pub struct ChannelProgress(pub mpsc::UnboundedSender<TransferProgress>);

impl ChannelProgress {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransferProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, progress: TransferProgress) {
        // A caller that stopped listening doesn't stop the transfer.
        let _ = self.0.send(progress);
    }
}
