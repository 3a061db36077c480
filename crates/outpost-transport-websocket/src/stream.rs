//! Dialed WebSocket seen as a duplex byte stream
//!
//! Every binary (or text) message is one chunk. A close frame or a closed
//! connection ends the stream.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use outpost_transport::{ChunkRead, ChunkWrite, DuplexStream, TransportError, TransportResult};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::MaybeTlsStream;
use tracing::trace;

/// Raw tungstenite stream as returned by the dialer
pub type RawWebSocket = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A dialed WebSocket carrying raw bytes
#[derive(Debug)]
pub struct WsStream {
    inner: RawWebSocket,
}

impl WsStream {
    pub fn new(inner: RawWebSocket) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> RawWebSocket {
        self.inner
    }
}

impl DuplexStream for WsStream {
    type Reader = WsReader;
    type Writer = WsWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, source) = self.inner.split();
        (WsReader { source }, WsWriter { sink })
    }
}

pub struct WsReader {
    source: SplitStream<RawWebSocket>,
}

pub struct WsWriter {
    sink: SplitSink<RawWebSocket, Message>,
}

#[async_trait]
impl ChunkRead for WsReader {
    async fn read_chunk(&mut self) -> TransportResult<Option<Bytes>> {
        loop {
            match self.source.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text.into_bytes()))),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {
                    // Ping/pong are answered by tungstenite
                    trace!("Skipping WebSocket control frame");
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(TransportError::WebSocketError(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl ChunkWrite for WsWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> TransportResult<()> {
        self.sink
            .send(Message::Binary(chunk.to_vec()))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::StreamClosed,
                e => TransportError::WebSocketError(e.to_string()),
            })
    }

    async fn close(&mut self) -> TransportResult<()> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::WebSocketError(e.to_string())),
        }
    }
}
