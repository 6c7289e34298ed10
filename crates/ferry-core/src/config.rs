//! Configuration system for Ferry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FERRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ferry/config.toml
//!   3. ~/.config/ferry/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::digest::DigestAlgorithm;
use crate::wire::{DEFAULT_ACK_TIMEOUT_SECS, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_IN_FLIGHT};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub transfer: TransferSettings,
    pub transport: TransportSettings,
}

/// Knobs of the chunk transfer engine. The defaults are the protocol
/// constants; change them only when both peers agree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Bytes per chunk. Announced to the receiver in START_TRANSFER.
    pub chunk_size: u32,
    /// Chunks sent but not yet acknowledged.
    pub max_in_flight: usize,
    /// Deadline for each chunk's acknowledgment, armed once the frame is written.
    pub ack_timeout_secs: u64,
    /// Per-chunk and whole-stream digest.
    pub digest: DigestAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Largest inbound frame a stream transport will buffer.
    pub max_frame_len: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            ack_timeout_secs: DEFAULT_ACK_TIMEOUT_SECS,
            digest: DigestAlgorithm::default(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

impl TransferSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    /// Reject engine settings that cannot run a transfer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("transfer.chunk_size must be > 0".into()));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid("transfer.max_in_flight must be > 0".into()));
        }
        if self.ack_timeout_secs == 0 {
            return Err(ConfigError::Invalid("transfer.ack_timeout_secs must be > 0".into()));
        }
        Ok(())
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ferry")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FerryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            FerryConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FERRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FerryConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transfer;
        t.validate()?;
        if self.transport.max_frame_len <= t.chunk_size as usize {
            return Err(ConfigError::Invalid(format!(
                "transport.max_frame_len ({}) must exceed transfer.chunk_size ({})",
                self.transport.max_frame_len, t.chunk_size
            )));
        }
        Ok(())
    }

    /// Apply FERRY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FERRY_TRANSFER__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.transfer.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("FERRY_TRANSFER__MAX_IN_FLIGHT") {
            if let Ok(n) = v.parse() {
                self.transfer.max_in_flight = n;
            }
        }
        if let Ok(v) = std::env::var("FERRY_TRANSFER__ACK_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.transfer.ack_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("FERRY_TRANSFER__DIGEST") {
            if let Ok(d) = v.parse() {
                self.transfer.digest = d;
            }
        }
        if let Ok(v) = std::env::var("FERRY_TRANSPORT__MAX_FRAME_LEN") {
            if let Ok(n) = v.parse() {
                self.transport.max_frame_len = n;
            }
        }
    }
}
