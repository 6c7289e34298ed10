//! Pending-ack table: chunks that are on the wire and awaiting a verdict.
//!
//! Three actors touch the table: the send loop inserts, the ack reader
//! removes, and per-chunk deadline timers remove. Removal from the map is
//! the claim: whichever actor removes an entry resolves its signal, and
//! every later attempt finds nothing and does nothing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::TransferError;

/// What a chunk's completion signal resolves to.
pub type ChunkOutcome = Result<(), TransferError>;

struct PendingAck {
    signal: oneshot::Sender<ChunkOutcome>,
    deadline: Option<AbortHandle>,
}

impl PendingAck {
    fn resolve(self, outcome: ChunkOutcome) {
        if let Some(deadline) = self.deadline {
            deadline.abort();
        }
        // The watcher may already be gone when the whole transfer is unwinding.
        let _ = self.signal.send(outcome);
    }
}

/// Chunk index → pending entry. Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct PendingAcks {
    entries: Arc<DashMap<u64, PendingAck>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track chunk `index`. The returned receiver resolves exactly once.
    pub fn register(&self, index: u64) -> oneshot::Receiver<ChunkOutcome> {
        let (signal, rx) = oneshot::channel();
        let entry = PendingAck {
            signal,
            deadline: None,
        };
        if let Some(stale) = self.entries.insert(index, entry) {
            tracing::warn!(chunk = index, "chunk registered twice, failing earlier entry");
            stale.resolve(Err(TransferError::Cancelled));
        }
        rx
    }

    /// Remove `index` and resolve it. Returns false if another actor got there first.
    pub fn resolve(&self, index: u64, outcome: ChunkOutcome) -> bool {
        match self.entries.remove(&index) {
            Some((_, entry)) => {
                entry.resolve(outcome);
                true
            }
            None => false,
        }
    }

    /// Start the acknowledgment deadline for `index`.
    ///
    /// If the deadline passes while the entry is still pending, the entry
    /// is removed, resolved with `AckTimeout`, and `on_expire` runs with
    /// that same error. An ack that arrives first disarms the timer.
    pub fn arm_deadline<F>(&self, index: u64, timeout: Duration, on_expire: F)
    where
        F: FnOnce(TransferError) + Send + 'static,
    {
        let table = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some((_, mut entry)) = table.entries.remove(&index) else {
                return;
            };
            // Don't abort ourselves while resolving.
            entry.deadline = None;
            let err = TransferError::AckTimeout {
                index,
                secs: timeout.as_secs(),
            };
            entry.resolve(Err(err.clone()));
            on_expire(err);
        });

        match self.entries.get_mut(&index) {
            Some(mut entry) => entry.deadline = Some(timer.abort_handle()),
            // Acked before the deadline was even armed.
            None => timer.abort(),
        }
    }

    /// Resolve every outstanding entry with `err`. Returns how many there were.
    pub fn fail_all(&self, err: &TransferError) -> usize {
        let indices: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for index in indices {
            if self.resolve(index, Err(err.clone())) {
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, index: u64) -> bool {
        self.entries.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
