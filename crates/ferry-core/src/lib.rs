//! ferry-core: wire format, content digests, and configuration.
//! The transfer engine and every peer implementation depend on this one.

pub mod config;
pub mod digest;
pub mod wire;

pub use digest::{ContentDigest, DigestAccumulator, DigestAlgorithm};
pub use wire::{Command, Frame, FrameMeta, WireError};
