//! Ferry integration test harness.
//!
//! Every test wires a real sender engine to the reference receiver over a
//! loopback TCP connection, so frames cross the length-prefixed stream
//! transport exactly as they would between two hosts.
//!
//!   cargo test --test integration
//!   RUST_LOG=ferry_transfer=debug cargo test --test integration -- --nocapture

mod failures;
mod transfer;

use std::sync::Arc;

use anyhow::{Context, Result};
use ferry_core::config::{FerryConfig, TransportSettings};
use ferry_core::digest::{ContentDigest, DigestAlgorithm};
use ferry_transfer::{
    ChunkReceiver, ChunkedTransferEngine, FrameTransport, ReceiveError, ReceivedTransfer,
    StreamTransport,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const CHUNK: usize = 262_144;

/// Install a test-friendly subscriber once; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic, non-repeating-per-chunk test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 997) % 256) as u8).collect()
}

/// Sender and receiver ends of one loopback TCP connection, both with
/// the default transport settings.
pub async fn tcp_pair() -> Result<(Arc<dyn FrameTransport>, Arc<dyn FrameTransport>)> {
    let config = FerryConfig::default();
    tcp_pair_with(&config.transport, &config.transport).await
}

/// Loopback TCP connection whose ends follow their own transport settings.
pub async fn tcp_pair_with(
    sender: &TransportSettings,
    receiver: &TransportSettings,
) -> Result<(Arc<dyn FrameTransport>, Arc<dyn FrameTransport>)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind loopback listener")?;
    let addr = listener.local_addr()?;

    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let client = client.context("failed to connect to loopback listener")?;
    let (server, _) = accepted.context("failed to accept loopback connection")?;

    Ok((
        Arc::new(StreamTransport::tcp_with(client, sender)),
        Arc::new(StreamTransport::tcp_with(server, receiver)),
    ))
}

pub fn sha256() -> Arc<dyn ContentDigest> {
    Arc::new(DigestAlgorithm::Sha256)
}

/// Engine plus a spawned reference receiver, both SHA-256.
pub async fn connect(
    existing: Vec<u8>,
) -> Result<(ChunkedTransferEngine, JoinHandle<Result<ReceivedTransfer, ReceiveError>>)> {
    let (sender, receiver) = tcp_pair().await?;
    let receiver = ChunkReceiver::new(receiver, sha256()).with_existing(existing);
    let handle = tokio::spawn(receiver.receive());
    Ok((ChunkedTransferEngine::new(sender, sha256()), handle))
}
