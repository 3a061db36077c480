//! Adapter turning any tokio byte stream into a [`DuplexStream`]

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::{ChunkRead, ChunkWrite, DuplexStream, TransportResult};

/// Read buffer size for socket copies (16KB)
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// A raw socket (or in-memory pipe) seen as a duplex chunk stream
#[derive(Debug)]
pub struct IoStream<T> {
    inner: T,
}

impl<T> IoStream<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> DuplexStream for IoStream<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Reader = IoReader<T>;
    type Writer = IoWriter<T>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (read, write) = tokio::io::split(self.inner);
        (
            IoReader {
                inner: read,
                buffer: vec![0u8; READ_BUFFER_SIZE],
            },
            IoWriter { inner: write },
        )
    }
}

pub struct IoReader<T> {
    inner: ReadHalf<T>,
    buffer: Vec<u8>,
}

pub struct IoWriter<T> {
    inner: WriteHalf<T>,
}

#[async_trait]
impl<T> ChunkRead for IoReader<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn read_chunk(&mut self) -> TransportResult<Option<Bytes>> {
        let n = self.inner.read(&mut self.buffer).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buffer[..n])))
    }
}

#[async_trait]
impl<T> ChunkWrite for IoWriter<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn write_chunk(&mut self, chunk: &[u8]) -> TransportResult<()> {
        self.inner.write_all(chunk).await?;
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
