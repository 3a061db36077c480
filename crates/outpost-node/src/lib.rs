//! Outpost node
//!
//! A node never accepts connections from the relay. It keeps one control
//! tunnel open and dials a fresh tunnel per TCP flow:
//!
//! - [`ControlClient`] keeps the control tunnel up and reconnects with backoff
//! - [`ForwardManager`] runs one listener per enabled forward rule
//! - [`TcpResponder`], [`UdpTerminator`] and [`UdpDelivery`] serve the
//!   messages the relay routes to this node
//! - [`NodeConfigStore`] persists the rules and the forwarding switch

pub mod config;
pub mod control;
pub mod manager;
pub mod node;
pub mod reconnect;
pub mod tcp;
pub mod udp;

pub use config::{ConfigError, NodeConfig, NodeConfigStore};
pub use control::{ControlClient, ControlHandle};
pub use manager::{ForwardManager, ForwardRuntimeState};
pub use node::Node;
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use tcp::TcpResponder;
pub use udp::{UdpDelivery, UdpSocketTable, UdpTerminator};

use outpost_bus::DEFAULT_MAILBOX_CAPACITY;
use outpost_proto::{ProtoError, KEEPALIVE_INTERVAL_SECS};
use outpost_transport::TransportError;
use outpost_transport_websocket::WebSocketConfig;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}

/// Everything a node needs to reach its relay
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// `wss://relay.example.com`, optionally with a path prefix
    pub relay_url: Url,
    pub websocket: WebSocketConfig,
    pub reconnect: ReconnectConfig,
    /// Interval between pings on the control tunnel
    pub keepalive_interval: Duration,
    /// How long a terminated datagram waits for its single reply
    pub udp_reply_timeout: Duration,
    /// Outbound queue size of the control tunnel
    pub mailbox_capacity: usize,
}

impl NodeSettings {
    pub fn new(relay_url: Url, websocket: WebSocketConfig) -> Self {
        Self {
            relay_url,
            websocket,
            reconnect: ReconnectConfig::default(),
            keepalive_interval: Duration::from_secs(KEEPALIVE_INTERVAL_SECS),
            udp_reply_timeout: Duration::from_secs(30),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}
