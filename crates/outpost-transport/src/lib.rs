//! Transport abstraction layer for Outpost tunnels
//!
//! Every byte path in the system (a raw TCP socket, the relay's upgraded
//! stream, a node's dialed WebSocket) is exposed as a [`DuplexStream`]: it can
//! be split into a half that yields chunks and a half that accepts chunks and
//! can be closed explicitly. The [`bridge`] copies between any two of them.

pub mod bridge;
pub mod io;

pub use bridge::{bridge, BridgeStats};
pub use io::IoStream;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Copy task failed: {0}")]
    TaskFailed(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Read half of a duplex stream
#[async_trait]
pub trait ChunkRead: Send + 'static {
    /// Next chunk of bytes, or `None` once the peer has closed
    async fn read_chunk(&mut self) -> TransportResult<Option<Bytes>>;
}

/// Write half of a duplex stream
#[async_trait]
pub trait ChunkWrite: Send + 'static {
    async fn write_chunk(&mut self, chunk: &[u8]) -> TransportResult<()>;

    /// Signal end of stream to the peer
    async fn close(&mut self) -> TransportResult<()>;
}

/// A stream that supports chunked duplex read/write and an explicit close
pub trait DuplexStream: Send + 'static {
    type Reader: ChunkRead;
    type Writer: ChunkWrite;

    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Close a stream that will not be bridged
pub async fn close_stream<S: DuplexStream>(stream: S) {
    let (_reader, mut writer) = stream.split();
    if let Err(e) = writer.close().await {
        tracing::debug!("Error while closing stream: {}", e);
    }
}
