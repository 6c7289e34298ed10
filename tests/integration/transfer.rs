use std::sync::Arc;

use anyhow::Result;
use ferry_core::config::FerryConfig;
use ferry_core::digest::{ContentDigest, DigestAlgorithm};
use ferry_transfer::{ChannelProgress, ChunkReceiver, ChunkedTransferEngine, TransferProgress};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  End-to-end transfers over loopback TCP
// ══════════════════════════════════════════════════════════════════════════════

fn collect(mut rx: tokio::sync::mpsc::UnboundedReceiver<TransferProgress>) -> Vec<TransferProgress> {
    let mut out = Vec::new();
    while let Ok(p) = rx.try_recv() {
        out.push(p);
    }
    out
}

/// The canonical 1,000,000-byte transfer: four chunks, last one short.
#[tokio::test]
async fn test_one_million_bytes() -> Result<()> {
    init_tracing();
    let input = pattern(1_000_000);
    let (engine, receiver) = connect(Vec::new()).await?;
    let (sink, rx) = ChannelProgress::channel();

    let report = engine
        .send(&input[..], input.len() as u64, "e2e-1m", Some(Arc::new(sink)), None)
        .await?;
    let received = receiver.await??;

    assert_eq!(report.total_chunks, 4);
    assert_eq!(report.chunks_sent, 4);
    assert_eq!(received.data.len(), 1_000_000);
    assert!(received.data[..] == input[..], "reassembled bytes differ");
    assert_eq!(received.file_digest, report.file_digest);
    assert_eq!(report.file_digest, DigestAlgorithm::Sha256.digest(&input));

    let snapshots = collect(rx);
    assert_eq!(snapshots.len(), 5);
    assert!(snapshots
        .windows(2)
        .all(|w| w[0].confirmed_bytes <= w[1].confirmed_bytes));
    let last = snapshots.last().unwrap();
    assert!(last.is_complete);
    assert_eq!(last.confirmed_bytes, 1_000_000);
    Ok(())
}

#[tokio::test]
async fn test_empty_stream() -> Result<()> {
    init_tracing();
    let (engine, receiver) = connect(Vec::new()).await?;

    let report = engine
        .send(tokio::io::empty(), 0, "e2e-empty", None, None)
        .await?;
    let received = receiver.await??;

    assert_eq!(report.total_chunks, 0);
    assert!(received.data.is_empty());
    assert_eq!(received.file_digest, DigestAlgorithm::Sha256.digest(b""));
    Ok(())
}

/// Exact multiple of the chunk size: the last chunk is a full one.
#[tokio::test]
async fn test_exact_chunk_multiple() -> Result<()> {
    init_tracing();
    let input = pattern(3 * CHUNK);
    let (engine, receiver) = connect(Vec::new()).await?;

    let report = engine
        .send(&input[..], input.len() as u64, "e2e-exact", None, None)
        .await?;
    let received = receiver.await??;

    assert_eq!(report.total_chunks, 3);
    assert!(received.data[..] == input[..]);
    Ok(())
}

/// Many small chunks through a narrow window, configured the way a
/// deployment would configure it.
#[tokio::test]
async fn test_config_driven_engine() -> Result<()> {
    init_tracing();
    let mut config = FerryConfig::default();
    config.transfer.chunk_size = 4096;
    config.transfer.max_in_flight = 2;
    config.transfer.digest = DigestAlgorithm::Blake3;
    config.validate()?;

    let input = pattern(100_000);
    let (sender, receiver) = tcp_pair().await?;
    let receiver = tokio::spawn(
        ChunkReceiver::new(receiver, Arc::new(config.transfer.digest)).receive(),
    );

    let engine = ChunkedTransferEngine::from_config(sender, &config);
    let report = engine
        .send(&input[..], input.len() as u64, "e2e-config", None, None)
        .await?;
    let received = receiver.await??;

    assert_eq!(report.total_chunks, 25);
    assert!(received.data[..] == input[..]);
    assert_eq!(report.file_digest, DigestAlgorithm::Blake3.digest(&input));
    Ok(())
}

/// Settings loaded from a config file, with an env override, reach both
/// the engine and the stream transports.
#[tokio::test]
async fn test_loaded_config_drives_transport() -> Result<()> {
    init_tracing();
    let dir = std::env::temp_dir().join(format!("ferry-it-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("config.toml");
    std::fs::write(
        &path,
        r#"
        [transfer]
        chunk_size = 4096
        digest = "blake3"

        [transport]
        max_frame_len = 65536
        "#,
    )?;

    // Nothing else in this binary reads FERRY_* variables.
    std::env::set_var("FERRY_CONFIG", &path);
    std::env::set_var("FERRY_TRANSPORT__MAX_FRAME_LEN", "8192");
    let loaded = FerryConfig::load();
    std::env::remove_var("FERRY_CONFIG");
    std::env::remove_var("FERRY_TRANSPORT__MAX_FRAME_LEN");
    let _ = std::fs::remove_dir_all(&dir);
    let config = loaded?;

    assert_eq!(config.transfer.chunk_size, 4096);
    assert_eq!(config.transport.max_frame_len, 8192);

    let input = pattern(50_000);
    let (sender, receiver) = tcp_pair_with(&config.transport, &config.transport).await?;
    let receiver = tokio::spawn(
        ChunkReceiver::new(receiver, Arc::new(config.transfer.digest)).receive(),
    );
    let report = ChunkedTransferEngine::from_config(sender, &config)
        .send(&input[..], input.len() as u64, "e2e-loaded", None, None)
        .await?;
    let received = receiver.await??;

    assert_eq!(report.total_chunks, 13);
    assert!(received.data[..] == input[..]);
    Ok(())
}

/// Two transfers back to back over separate connections share nothing.
#[tokio::test]
async fn test_independent_transfers() -> Result<()> {
    init_tracing();
    let first = pattern(300_000);
    let second = pattern(700_000);

    let (a, recv_a) = connect(Vec::new()).await?;
    let (b, recv_b) = connect(Vec::new()).await?;
    let (ra, rb) = tokio::join!(
        a.send(&first[..], first.len() as u64, "e2e-a", None, None),
        b.send(&second[..], second.len() as u64, "e2e-b", None, None),
    );

    assert_eq!(ra?.transfer_id, "e2e-a");
    assert_eq!(rb?.transfer_id, "e2e-b");
    assert!(recv_a.await??.data[..] == first[..]);
    assert!(recv_b.await??.data[..] == second[..]);
    Ok(())
}

/// Same protocol over the in-process transport, for embedding both peers
/// in one program.
#[tokio::test]
async fn test_in_memory_peers() -> Result<()> {
    init_tracing();
    let input = pattern(2 * CHUNK + 1);
    let (sender, receiver) = ferry_transfer::MemoryTransport::pair();
    let receiver = tokio::spawn(ChunkReceiver::new(Arc::new(receiver), sha256()).receive());

    let report = ChunkedTransferEngine::new(Arc::new(sender), sha256())
        .send(&input[..], input.len() as u64, "in-memory", None, None)
        .await?;
    let received = receiver.await??;

    assert_eq!(report.total_chunks, 3);
    assert_eq!(received.data.len(), input.len());
    assert!(received.data[..] == input[..]);
    Ok(())
}
