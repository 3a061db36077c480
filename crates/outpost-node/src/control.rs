//! The node's standing control tunnel
//!
//! One WebSocket to the relay carries TCP forward notices and UDP datagrams.
//! Every connection attempt gets a fresh instance id. Outbound messages are
//! queued in a mailbox of the node's own [`MessageBus`]; inbound messages are
//! handed to the bus readers (TCP responder, UDP terminator and delivery).

use futures_util::{SinkExt, StreamExt};
use outpost_bus::{MailboxReader, MessageBus};
use outpost_proto::ControlMessage;
use outpost_transport_websocket::{RawWebSocket, RelayConnector};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::reconnect::{ReconnectConfig, ReconnectManager};
use crate::NodeError;

/// Shared view of the control tunnel used by forwarders
#[derive(Clone)]
pub struct ControlHandle {
    bus: MessageBus<ControlMessage, String>,
    current: Arc<Mutex<Option<String>>>,
}

impl ControlHandle {
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            bus: MessageBus::new(mailbox_capacity),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Instance id of the tunnel that is up right now
    pub fn instance_id(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.instance_id().is_some()
    }

    /// Queue a message on the current tunnel. Returns false while disconnected.
    pub fn send(&self, message: ControlMessage) -> bool {
        match self.instance_id() {
            Some(instance_id) => self.bus.unicast(message, &instance_id),
            None => {
                debug!("Control tunnel down, dropping {}", message.kind());
                false
            }
        }
    }

    /// Register a handler for messages arriving from the relay
    pub fn add_reader<R>(&self, reader: R)
    where
        R: MailboxReader<ControlMessage, String>,
    {
        self.bus.add_reader(reader);
    }

    pub(crate) fn bus(&self) -> &MessageBus<ControlMessage, String> {
        &self.bus
    }

    pub(crate) fn set_current(&self, instance_id: Option<String>) {
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = instance_id;
    }

    // A newer tunnel may already have taken over
    fn clear_current(&self, instance_id: &str) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if current.as_deref() == Some(instance_id) {
            *current = None;
        }
    }
}

/// Keeps the control tunnel up, reconnecting with backoff
pub struct ControlClient {
    connector: RelayConnector,
    handle: ControlHandle,
    reconnect: ReconnectConfig,
    keepalive: Duration,
}

impl ControlClient {
    pub fn new(
        connector: RelayConnector,
        handle: ControlHandle,
        reconnect: ReconnectConfig,
        keepalive: Duration,
    ) -> Self {
        Self {
            connector,
            handle,
            reconnect,
            keepalive,
        }
    }

    pub fn handle(&self) -> &ControlHandle {
        &self.handle
    }

    /// Run until the reconnect budget is exhausted. With the default
    /// configuration this never returns.
    pub async fn run(self) -> Result<(), NodeError> {
        let mut backoff = ReconnectManager::new(self.reconnect.clone());

        loop {
            let instance_id = uuid::Uuid::new_v4().to_string();

            match self.connector.connect_control(&instance_id).await {
                Ok(socket) => {
                    info!(
                        instance_id = %instance_id,
                        relay = %self.connector.base_url(),
                        "Control tunnel established"
                    );
                    backoff.reset();
                    match self.run_session(&instance_id, socket).await {
                        Ok(()) => info!(instance_id = %instance_id, "Control tunnel closed"),
                        Err(e) => warn!(instance_id = %instance_id, "Control tunnel lost: {}", e),
                    }
                }
                Err(e) => {
                    warn!(
                        relay = %self.connector.base_url(),
                        attempt = backoff.attempt() + 1,
                        "Failed to connect control tunnel: {}",
                        e
                    );
                }
            }

            backoff.wait().await?;
        }
    }

    async fn run_session(&self, instance_id: &str, socket: RawWebSocket) -> Result<(), NodeError> {
        let bus = &self.handle.bus;
        let mut mailbox = bus.create_mailbox(instance_id.to_string());
        let mailbox_id = mailbox.id();
        self.handle.set_current(Some(instance_id.to_string()));

        let (mut sink, mut source) = socket.split();
        let mut keepalive = tokio::time::interval(self.keepalive);
        keepalive.tick().await;

        let result: Result<(), NodeError> = async {
            loop {
                tokio::select! {
                    outbound = mailbox.recv() => {
                        let Some(message) = outbound else { break };
                        sink.send(Message::Text(message.to_json()?)).await?;
                    }
                    _ = keepalive.tick() => {
                        let ping = ControlMessage::Ping {
                            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
                        };
                        sink.send(Message::Text(ping.to_json()?)).await?;
                    }
                    frame = source.next() => match frame {
                        Some(Ok(Message::Text(text))) => match ControlMessage::from_json(&text) {
                            Ok(ControlMessage::Ping { timestamp }) => {
                                let pong = ControlMessage::Pong { timestamp };
                                sink.send(Message::Text(pong.to_json()?)).await?;
                            }
                            Ok(ControlMessage::Pong { .. }) => {}
                            Ok(message) => {
                                bus.dispatch_inbound(message, instance_id.to_string());
                            }
                            Err(e) => debug!("Ignoring malformed control frame: {}", e),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    },
                }
            }
            Ok(())
        }
        .await;

        self.handle.clear_current(instance_id);
        bus.close_mailbox(mailbox_id);
        let _ = sink.close().await;
        result
    }
}
