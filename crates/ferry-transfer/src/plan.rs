//! Transfer plan: how a stream of known length splits into chunks.

use ferry_core::wire::StartTransfer;

/// Derived once per send; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub transfer_id: String,
    pub total_bytes: u64,
    pub chunk_size: u32,
    /// `ceil(total_bytes / chunk_size)`, zero for an empty stream.
    pub total_chunks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("transfer id must not be empty")]
    BlankTransferId,

    #[error("chunk size must be positive")]
    ZeroChunkSize,
}

/// One chunk as it goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: u64,
    pub length: usize,
    pub digest: String,
    pub is_last: bool,
}

impl TransferPlan {
    pub fn new(
        transfer_id: impl Into<String>,
        total_bytes: u64,
        chunk_size: u32,
    ) -> Result<Self, PlanError> {
        let transfer_id = transfer_id.into();
        if transfer_id.trim().is_empty() {
            return Err(PlanError::BlankTransferId);
        }
        if chunk_size == 0 {
            return Err(PlanError::ZeroChunkSize);
        }
        Ok(Self {
            transfer_id,
            total_bytes,
            chunk_size,
            total_chunks: total_bytes.div_ceil(u64::from(chunk_size)),
        })
    }

    /// Length of chunk `index`: the chunk size for every chunk but the
    /// last, which carries the remainder (or a full chunk when the stream
    /// divides evenly).
    pub fn chunk_length(&self, index: u64) -> usize {
        debug_assert!(index < self.total_chunks);
        let chunk_size = u64::from(self.chunk_size);
        if index + 1 < self.total_chunks {
            return self.chunk_size as usize;
        }
        match self.total_bytes % chunk_size {
            0 => self.chunk_size as usize,
            rem => rem as usize,
        }
    }

    pub fn is_last(&self, index: u64) -> bool {
        index + 1 == self.total_chunks
    }

    /// Byte offset at which chunk `index` starts.
    pub fn offset(&self, index: u64) -> u64 {
        index.saturating_mul(u64::from(self.chunk_size))
    }

    /// Bytes covered by the first `chunks` chunks.
    pub fn bytes_through(&self, chunks: u64) -> u64 {
        self.offset(chunks).min(self.total_bytes)
    }

    pub fn describe(&self, index: u64, digest: String) -> ChunkDescriptor {
        ChunkDescriptor {
            index,
            length: self.chunk_length(index),
            digest,
            is_last: self.is_last(index),
        }
    }

    pub fn start_meta(&self) -> StartTransfer {
        StartTransfer {
            transfer_id: self.transfer_id.clone(),
            total_bytes: self.total_bytes,
            total_chunks: self.total_chunks,
            chunk_size: self.chunk_size,
        }
    }
}
