//! Frame transports: the byte channel the engine talks through.
//!
//! The engine treats frames as opaque. A transport only has to hand over
//! one complete frame per `receive_frame` call and write one complete
//! frame per `send_frame` call. Both methods take `&self` so the send
//! loop and the ack reader can share one transport.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::config::TransportSettings;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("frame of {len} bytes exceeds limit of {limit}")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("transport closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(Arc::new(e))
    }
}

#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Write one complete frame.
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Wait for the next complete frame. `None` once the peer has closed.
    async fn receive_frame(&self) -> Result<Option<Bytes>, TransportError>;
}

// ── Stream transport ──────────────────────────────────────────────────────────

/// Frames over a byte stream with a 4-byte big-endian length prefix.
///
/// A zero-length frame is the peer's end-of-stream marker. Dropping a
/// `receive_frame` future part-way through a frame desynchronizes the
/// stream; the engine only does so when it is abandoning the transfer.
pub struct StreamTransport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    max_frame_len: usize,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::from_settings(reader, writer, &TransportSettings::default())
    }

    pub fn from_settings(reader: R, writer: W, settings: &TransportSettings) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            max_frame_len: settings.max_frame_len,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

impl StreamTransport<OwnedReadHalf, OwnedWriteHalf> {
    pub fn tcp(stream: TcpStream) -> Self {
        Self::tcp_with(stream, &TransportSettings::default())
    }

    pub fn tcp_with(stream: TcpStream, settings: &TransportSettings) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_settings(reader, writer, settings)
    }
}

#[async_trait]
impl<R, W> FrameTransport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        let len = u32::try_from(frame.len()).map_err(|_| TransportError::FrameTooLarge {
            len: frame.len(),
            limit: u32::MAX as usize,
        })?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive_frame(&self) -> Result<Option<Bytes>, TransportError> {
        let mut reader = self.reader.lock().await;

        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < prefix.len() {
            let n = reader.read(&mut prefix[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed inside a length prefix",
                )
                .into());
            }
            filled += n;
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len,
                limit: self.max_frame_len,
            });
        }

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok(Some(Bytes::from(buf)))
    }
}

// ── In-memory transport ───────────────────────────────────────────────────────

/// One end of an in-process frame channel.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl MemoryTransport {
    /// Two connected endpoints. Dropping one closes the other's receive side.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(a_rx),
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(b_rx),
            },
        )
    }
}

#[async_trait]
impl FrameTransport for MemoryTransport {
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn receive_frame(&self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.lock().await.recv().await)
    }
}
