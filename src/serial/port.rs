//! Port handles with single-lock reader/writer semantics.
//!
//! A [`PortHandle`] outlives individual open/close cycles, the same way a
//! granted device does. Opening it splits the byte stream into a readable and
//! a writable end; each end can be held by at most one [`PortReader`] or
//! [`PortWriter`] at a time and goes back to the handle on `release_lock`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use super::{Result, SerialDeviceInfo, SerialError};

pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// Produces the raw byte stream behind a port.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open_stream(&self, info: &SerialDeviceInfo, baud_rate: u32) -> Result<BoxedStream>;
}

#[derive(Default)]
struct PortInner {
    open: bool,
    readable: Option<ReadHalf<BoxedStream>>,
    writable: Option<WriteHalf<BoxedStream>>,
    // bumped on every open so halves from an earlier session are never reattached
    generation: u64,
}

pub struct PortHandle {
    info: SerialDeviceInfo,
    opener: Arc<dyn StreamOpener>,
    inner: Mutex<PortInner>,
}

impl PortHandle {
    pub fn new(info: SerialDeviceInfo, opener: Arc<dyn StreamOpener>) -> Arc<Self> {
        Arc::new(Self {
            info,
            opener,
            inner: Mutex::new(PortInner::default()),
        })
    }

    pub fn info(&self) -> &SerialDeviceInfo {
        &self.info
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.open
    }

    /// Open the port. Fails with [`SerialError::AlreadyOpen`] if it is open.
    pub async fn open(&self, baud_rate: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.open {
            return Err(SerialError::AlreadyOpen);
        }

        let stream = self.opener.open_stream(&self.info, baud_rate).await?;
        let (readable, writable) = tokio::io::split(stream);
        inner.readable = Some(readable);
        inner.writable = Some(writable);
        inner.generation += 1;
        inner.open = true;

        log::debug!("Opened {} at {} baud", self.info.port_name, baud_rate);
        Ok(())
    }

    /// Close the port. Ends still held by a reader or writer are dropped when
    /// their holder releases them. Closing a closed port is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.open {
            return Ok(());
        }
        inner.open = false;
        inner.readable = None;
        inner.writable = None;

        log::debug!("Closed {}", self.info.port_name);
        Ok(())
    }

    /// True while the readable end is held by a reader.
    pub async fn is_readable_locked(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.open && inner.readable.is_none()
    }

    pub async fn reader(self: &Arc<Self>, chunk_size: usize) -> Result<PortReader> {
        let mut inner = self.inner.lock().await;
        if !inner.open {
            return Err(SerialError::NotOpen);
        }
        let half = inner.readable.take().ok_or(SerialError::StreamLocked)?;

        Ok(PortReader {
            half,
            port: Arc::clone(self),
            generation: inner.generation,
            buf: vec![0u8; chunk_size.max(1)],
        })
    }

    pub async fn writer(self: &Arc<Self>) -> Result<PortWriter> {
        let mut inner = self.inner.lock().await;
        if !inner.open {
            return Err(SerialError::NotOpen);
        }
        let half = inner.writable.take().ok_or(SerialError::StreamLocked)?;

        Ok(PortWriter {
            half,
            port: Arc::clone(self),
            generation: inner.generation,
        })
    }

    async fn return_readable(&self, half: ReadHalf<BoxedStream>, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.open && inner.generation == generation {
            inner.readable = Some(half);
        }
    }

    async fn return_writable(&self, half: WriteHalf<BoxedStream>, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.open && inner.generation == generation {
            inner.writable = Some(half);
        }
    }
}

impl std::fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortHandle").field("info", &self.info).finish_non_exhaustive()
    }
}

pub struct PortReader {
    half: ReadHalf<BoxedStream>,
    port: Arc<PortHandle>,
    generation: u64,
    buf: Vec<u8>,
}

impl PortReader {
    /// Next chunk from the device, `None` once the stream is closed.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>> {
        let n = self.half.read(&mut self.buf).await?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(self.buf[..n].to_vec()))
        }
    }

    pub async fn release_lock(self) {
        self.port.return_readable(self.half, self.generation).await;
    }
}

pub struct PortWriter {
    half: WriteHalf<BoxedStream>,
    port: Arc<PortHandle>,
    generation: u64,
}

impl PortWriter {
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.half.write_all(data).await?;
        self.half.flush().await?;
        Ok(())
    }

    pub async fn release_lock(self) {
        self.port.return_writable(self.half, self.generation).await;
    }
}
