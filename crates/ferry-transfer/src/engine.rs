//! Chunked transfer engine: the sending side of the protocol.
//!
//! One `send` call runs these phases in order:
//!
//! ```text
//!   negotiate ──► send loop ─┐
//!                            ├─► drain watchers ──► COMPLETE
//!             ack reader ────┘
//! ```
//!
//! The send loop and the ack reader run concurrently on the caller's task
//! and share the pending-ack table, a semaphore bounding the in-flight
//! window, and one cancellation token. Every chunk gets a small watcher
//! task that holds its window slot until the chunk's signal resolves.
//!
//! Any fault trips the abort signal: the first fault is recorded, the
//! token is cancelled, every still-pending chunk is failed with the same
//! fault, and a best-effort ERROR frame goes to the peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use ferry_core::config::{FerryConfig, TransferSettings};
use ferry_core::digest::ContentDigest;
use ferry_core::wire::{ChunkMeta, Command, Complete, ErrorMeta, Frame};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::ack_reader::AckReader;
use crate::error::{TransferError, TransferFailure, ValidationError};
use crate::negotiate::negotiate;
use crate::pending::{ChunkOutcome, PendingAcks};
use crate::plan::TransferPlan;
use crate::progress::{ProgressSink, TransferProgress};
use crate::transport::FrameTransport;

/// How long a failing transfer waits to hand its ERROR frame to the transport.
const ERROR_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

/// Summary of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub transfer_id: String,
    pub total_chunks: u64,
    /// First chunk index sent; non-zero when the peer resumed.
    pub resumed_from: u64,
    pub chunks_sent: u64,
    /// Digest of the entire stream, as sent in COMPLETE.
    pub file_digest: String,
}

pub struct ChunkedTransferEngine {
    transport: Arc<dyn FrameTransport>,
    digest: Arc<dyn ContentDigest>,
    settings: TransferSettings,
}

// ── Abort signal ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Origin {
    Negotiation,
    Send,
    Reader,
}

impl Origin {
    fn wrap(self, err: TransferError) -> TransferFailure {
        match self {
            Origin::Negotiation => TransferFailure::Negotiation(err),
            Origin::Send => TransferFailure::Send(err),
            Origin::Reader => TransferFailure::Reader(err),
        }
    }
}

/// First fault wins; every trip cancels.
struct Abort {
    first: OnceLock<(Origin, TransferError)>,
    token: CancellationToken,
    /// A chunk write was abandoned part-way; the stream is mid-frame.
    desynced: AtomicBool,
}

impl Abort {
    fn new(token: CancellationToken) -> Self {
        Self {
            first: OnceLock::new(),
            token,
            desynced: AtomicBool::new(false),
        }
    }

    fn mark_desynced(&self) {
        self.desynced.store(true, Ordering::SeqCst);
    }

    fn is_desynced(&self) -> bool {
        self.desynced.load(Ordering::SeqCst)
    }

    fn trip(&self, origin: Origin, err: TransferError) {
        if self.first.set((origin, err)).is_ok() {
            tracing::debug!(?origin, "transfer aborting");
        }
        self.token.cancel();
    }

    fn fault(&self) -> Option<(Origin, TransferError)> {
        self.first.get().cloned()
    }
}

// ── Progress tally ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Confirmed {
    chunks: u64,
    bytes: u64,
}

/// Confirmed counters plus the caller's sink. Snapshots are reported
/// under the lock so the sink sees them in counter order.
struct Tally {
    transfer_id: String,
    total_chunks: u64,
    total_bytes: u64,
    confirmed: Mutex<Confirmed>,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl Tally {
    fn new(plan: &TransferPlan, resume_from: u64, sink: Option<Arc<dyn ProgressSink>>) -> Self {
        Self {
            transfer_id: plan.transfer_id.clone(),
            total_chunks: plan.total_chunks,
            total_bytes: plan.total_bytes,
            confirmed: Mutex::new(Confirmed {
                chunks: resume_from,
                bytes: plan.bytes_through(resume_from),
            }),
            sink,
        }
    }

    async fn confirm(&self, bytes: u64) {
        let mut confirmed = self.confirmed.lock().await;
        confirmed.chunks += 1;
        confirmed.bytes += bytes;
        self.report(*confirmed, false);
    }

    async fn complete(&self) {
        let done = Confirmed {
            chunks: self.total_chunks,
            bytes: self.total_bytes,
        };
        *self.confirmed.lock().await = done;
        self.report(done, true);
    }

    fn report(&self, confirmed: Confirmed, is_complete: bool) {
        if let Some(sink) = &self.sink {
            sink.report(TransferProgress {
                transfer_id: self.transfer_id.clone(),
                confirmed_chunks: confirmed.chunks,
                total_chunks: self.total_chunks,
                confirmed_bytes: confirmed.bytes,
                total_bytes: self.total_bytes,
                is_complete,
            });
        }
    }
}

/// Hold the window slot until the chunk resolves and, on success, is
/// counted. The next chunk cannot be sent before this one is reported.
async fn watch_chunk(
    signal: oneshot::Receiver<ChunkOutcome>,
    slot: OwnedSemaphorePermit,
    tally: Arc<Tally>,
    length: u64,
) {
    let outcome = signal.await.unwrap_or(Err(TransferError::Cancelled));
    if outcome.is_ok() {
        tally.confirm(length).await;
    }
    drop(slot);
}

/// Read exactly `expected` bytes for chunk `index`.
async fn read_chunk<R>(source: &mut R, index: u64, expected: usize) -> Result<Bytes, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; expected];
    let mut got = 0;
    while got < expected {
        let n = source.read(&mut buf[got..]).await?;
        if n == 0 {
            return Err(TransferError::PrematureStreamEnd {
                index,
                got,
                expected,
            });
        }
        got += n;
    }
    Ok(Bytes::from(buf))
}

// ── Engine ────────────────────────────────────────────────────────────────────

impl ChunkedTransferEngine {
    pub fn new(transport: Arc<dyn FrameTransport>, digest: Arc<dyn ContentDigest>) -> Self {
        Self {
            transport,
            digest,
            settings: TransferSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: TransferSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Engine using the configured digest algorithm and transfer settings.
    pub fn from_config(transport: Arc<dyn FrameTransport>, config: &FerryConfig) -> Self {
        Self::new(transport, Arc::new(config.transfer.digest))
            .with_settings(config.transfer.clone())
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Send `total_bytes` from `source` as transfer `transfer_id`.
    ///
    /// `source` must yield the whole stream from its first byte, even when
    /// the peer resumes: already-confirmed chunks are read and folded into
    /// the whole-stream digest but not sent again.
    ///
    /// Cancelling `cancel` fails the transfer with `Cancelled`. The engine
    /// only ever cancels a child of it, so internal aborts never reach the
    /// caller's token.
    pub async fn send<R>(
        &self,
        mut source: R,
        total_bytes: u64,
        transfer_id: &str,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: Option<CancellationToken>,
    ) -> Result<TransferReport, TransferFailure>
    where
        R: AsyncRead + Unpin + Send,
    {
        let plan = self.plan(transfer_id, total_bytes)?;
        let token = cancel.map(|c| c.child_token()).unwrap_or_default();
        let abort = Arc::new(Abort::new(token));
        let pending = PendingAcks::new();
        let mut watchers = JoinSet::new();

        tracing::info!(
            transfer_id = %plan.transfer_id,
            bytes = plan.total_bytes,
            chunks = plan.total_chunks,
            "starting transfer"
        );

        let negotiated = tokio::select! {
            biased;
            _ = abort.token.cancelled() => Err(TransferError::Cancelled),
            r = negotiate(self.transport.as_ref(), &plan) => r,
        };
        let resume_from = match negotiated {
            Ok(r) => r,
            Err(e) => {
                abort.trip(Origin::Negotiation, e);
                return Err(self.fail(&plan, &abort, &pending, &mut watchers).await);
            }
        };

        let tally = Arc::new(Tally::new(&plan, resume_from, progress));
        let reader = AckReader::new(
            self.transport.as_ref(),
            pending.clone(),
            &plan.transfer_id,
            plan.total_chunks - resume_from,
            abort.token.clone(),
        );

        let send_loop = async {
            let sent = self
                .send_chunks(&plan, &mut source, resume_from, &pending, &tally, &abort, &mut watchers)
                .await;
            match sent {
                Ok(file_digest) => Some(file_digest),
                Err(e) => {
                    abort.trip(Origin::Send, e);
                    None
                }
            }
        };
        let ack_loop = async {
            if let Err(e) = reader.run().await {
                abort.trip(Origin::Reader, e);
            }
        };
        let (file_digest, ()) = tokio::join!(send_loop, ack_loop);

        // The reader exits quietly on cancellation; a caller cancel with no
        // other fault still has to surface.
        if abort.fault().is_none() && abort.token.is_cancelled() {
            abort.trip(Origin::Send, TransferError::Cancelled);
        }
        let file_digest = match file_digest {
            Some(d) if abort.fault().is_none() => d,
            _ => return Err(self.fail(&plan, &abort, &pending, &mut watchers).await),
        };

        // Every ack is in, so every watcher is finishing; their progress
        // snapshots land before the final one.
        while watchers.join_next().await.is_some() {}

        let complete = Command::Complete(Complete {
            transfer_id: plan.transfer_id.clone(),
            file_digest: file_digest.clone(),
        });
        if let Err(e) = self.send_control(complete).await {
            abort.trip(Origin::Send, e);
            return Err(self.fail(&plan, &abort, &pending, &mut watchers).await);
        }
        tally.complete().await;

        tracing::info!(
            transfer_id = %plan.transfer_id,
            chunks = plan.total_chunks,
            resumed_from = resume_from,
            "transfer complete"
        );

        Ok(TransferReport {
            transfer_id: plan.transfer_id.clone(),
            total_chunks: plan.total_chunks,
            resumed_from: resume_from,
            chunks_sent: plan.total_chunks - resume_from,
            file_digest,
        })
    }

    fn plan(&self, transfer_id: &str, total_bytes: u64) -> Result<TransferPlan, TransferFailure> {
        self.settings
            .validate()
            .map_err(|e| TransferFailure::Validation(ValidationError::Settings(e)))?;
        TransferPlan::new(transfer_id, total_bytes, self.settings.chunk_size)
            .map_err(|e| TransferFailure::Validation(ValidationError::Plan(e)))
    }

    /// Read, digest, and transmit chunks `resume_from..total_chunks`.
    /// Returns the whole-stream digest.
    #[allow(clippy::too_many_arguments)]
    async fn send_chunks<R>(
        &self,
        plan: &TransferPlan,
        source: &mut R,
        resume_from: u64,
        pending: &PendingAcks,
        tally: &Arc<Tally>,
        abort: &Arc<Abort>,
        watchers: &mut JoinSet<()>,
    ) -> Result<String, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let cancel = &abort.token;
        let gate = Arc::new(Semaphore::new(self.settings.max_in_flight));
        let timeout = self.settings.ack_timeout();
        let mut whole = self.digest.accumulator();

        // Chunks the peer already holds still count toward the whole-stream digest.
        for index in 0..resume_from {
            let buf = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                r = read_chunk(source, index, plan.chunk_length(index)) => r?,
            };
            whole.update(&buf);
        }

        for index in resume_from..plan.total_chunks {
            let buf = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                r = read_chunk(source, index, plan.chunk_length(index)) => r?,
            };
            whole.update(&buf);
            let chunk = plan.describe(index, self.digest.digest(&buf));

            let slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                p = gate.clone().acquire_owned() => p.map_err(|_| TransferError::Cancelled)?,
            };

            let signal = pending.register(index);
            watchers.spawn(watch_chunk(signal, slot, tally.clone(), chunk.length as u64));

            let frame = Frame::chunk(
                ChunkMeta {
                    transfer_id: plan.transfer_id.clone(),
                    chunk_index: index,
                    digest: chunk.digest,
                },
                buf,
            )
            .encode()?;
            let write = self.transport.send_frame(frame);
            tokio::pin!(write);
            tokio::select! {
                biased;
                r = &mut write => r?,
                _ = cancel.cancelled() => {
                    // A half-written frame would garble the ERROR notice behind it.
                    if tokio::time::timeout(ERROR_NOTICE_TIMEOUT, write).await.is_err() {
                        tracing::warn!(
                            transfer_id = %plan.transfer_id,
                            chunk = index,
                            "abandoned chunk write, stream left mid-frame"
                        );
                        abort.mark_desynced();
                    }
                    return Err(TransferError::Cancelled);
                }
            }

            let expired = abort.clone();
            let transfer_id = plan.transfer_id.clone();
            pending.arm_deadline(index, timeout, move |err| {
                tracing::error!(%transfer_id, chunk = index, "acknowledgment deadline missed");
                expired.trip(Origin::Send, err);
            });

            tracing::debug!(
                transfer_id = %plan.transfer_id,
                chunk = index,
                bytes = chunk.length,
                last = chunk.is_last,
                "chunk sent"
            );
        }

        Ok(whole.finalize())
    }

    /// Unwind a failed transfer and build the caller-facing failure.
    async fn fail(
        &self,
        plan: &TransferPlan,
        abort: &Abort,
        pending: &PendingAcks,
        watchers: &mut JoinSet<()>,
    ) -> TransferFailure {
        abort.token.cancel();
        let (origin, err) = abort
            .fault()
            .unwrap_or((Origin::Send, TransferError::Cancelled));

        let orphaned = pending.fail_all(&err);
        while watchers.join_next().await.is_some() {}

        tracing::warn!(
            transfer_id = %plan.transfer_id,
            ?origin,
            error = %err,
            orphaned,
            "transfer failed"
        );

        if abort.is_desynced() {
            tracing::warn!(transfer_id = %plan.transfer_id, "stream mid-frame, not sending ERROR frame");
            return origin.wrap(err);
        }
        let notice = Command::Error(ErrorMeta {
            transfer_id: plan.transfer_id.clone(),
            reason: err.to_string(),
        });
        match tokio::time::timeout(ERROR_NOTICE_TIMEOUT, self.send_control(notice)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(transfer_id = %plan.transfer_id, error = %e, "could not send ERROR frame");
            }
            Err(_) => {
                tracing::warn!(transfer_id = %plan.transfer_id, "timed out sending ERROR frame");
            }
        }

        origin.wrap(err)
    }

    async fn send_control(&self, command: Command) -> Result<(), TransferError> {
        let frame = Frame::control(command).encode()?;
        self.transport.send_frame(frame).await?;
        Ok(())
    }
}
