//! Content digests for chunk and whole-stream integrity.
//!
//! Provides two algorithms behind one object-safe trait:
//!   1. SHA-256, the default, understood by every deployed receiver
//!   2. BLAKE3, faster, for peers that negotiate it out of band
//!
//! Digests travel on the wire as lowercase hex strings.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Computes a stable identifier for a byte buffer.
pub trait ContentDigest: Send + Sync {
    /// Digest of `data` as lowercase hex.
    fn digest(&self, data: &[u8]) -> String;

    /// Incremental hasher producing the same identifier as `digest` over
    /// the concatenation of everything fed to it.
    fn accumulator(&self) -> Box<dyn DigestAccumulator>;

    /// Compare `data` against a hex digest produced by any peer.
    fn verify(&self, data: &[u8], expected: &str) -> bool {
        self.digest(data).eq_ignore_ascii_case(expected)
    }
}

/// Running digest for payloads that arrive in pieces.
///
/// # Example
/// ```
/// use ferry_core::digest::{ContentDigest, DigestAlgorithm};
/// let sha = DigestAlgorithm::Sha256;
/// let mut acc = sha.accumulator();
/// acc.update(b"hello ");
/// acc.update(b"world");
/// assert_eq!(acc.finalize(), sha.digest(b"hello world"));
/// ```
pub trait DigestAccumulator: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> String;
}

// ── Algorithms ────────────────────────────────────────────────────────────────

/// Digest algorithm selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Blake3 => "blake3",
        }
    }
}

impl std::str::FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            "blake3" => Ok(DigestAlgorithm::Blake3),
            other => Err(format!("unknown digest algorithm: {other}")),
        }
    }
}

impl ContentDigest for DigestAlgorithm {
    fn digest(&self, data: &[u8]) -> String {
        match self {
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            DigestAlgorithm::Blake3 => blake3::hash(data).to_hex().to_string(),
        }
    }

    fn accumulator(&self) -> Box<dyn DigestAccumulator> {
        match self {
            DigestAlgorithm::Sha256 => Box::new(Sha256Accumulator(Sha256::new())),
            DigestAlgorithm::Blake3 => Box::new(Blake3Accumulator(blake3::Hasher::new())),
        }
    }
}

struct Sha256Accumulator(Sha256);

impl DigestAccumulator for Sha256Accumulator {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

struct Blake3Accumulator(blake3::Hasher);

impl DigestAccumulator for Blake3Accumulator {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> String {
        self.0.finalize().to_hex().to_string()
    }
}
