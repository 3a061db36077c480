//! Upgraded relay-side WebSocket seen as a duplex byte stream

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use outpost_transport::{ChunkRead, ChunkWrite, DuplexStream, TransportError, TransportResult};
use tracing::trace;

/// One forward leg accepted by the relay
pub struct WsTunnel {
    socket: WebSocket,
}

impl WsTunnel {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl DuplexStream for WsTunnel {
    type Reader = WsTunnelReader;
    type Writer = WsTunnelWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, source) = self.socket.split();
        (WsTunnelReader { source }, WsTunnelWriter { sink })
    }
}

pub struct WsTunnelReader {
    source: SplitStream<WebSocket>,
}

pub struct WsTunnelWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl ChunkRead for WsTunnelReader {
    async fn read_chunk(&mut self) -> TransportResult<Option<Bytes>> {
        loop {
            match self.source.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_str().as_bytes())))
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => trace!("Skipping WebSocket control frame"),
                Some(Err(e)) => return Err(TransportError::WebSocketError(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl ChunkWrite for WsTunnelWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> TransportResult<()> {
        self.sink
            .send(Message::Binary(Bytes::copy_from_slice(chunk)))
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }
}
