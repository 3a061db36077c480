//! WebSocket transport for Outpost nodes, built on tokio-tungstenite
//!
//! Nodes never accept connections. Everything they exchange with the relay
//! goes over WebSockets they dial themselves:
//!
//! - **Control tunnel**: `GET /node/connect`, one per connection attempt,
//!   carrying JSON text frames
//! - **Forward legs**: `GET /fwd/request` and `GET /fwd/response`, one per TCP
//!   flow, carrying raw bytes in binary frames
//!
//! # Security
//!
//! `wss://` dials go through rustls and present the node's client
//! certificate. The relay's TLS terminator verifies it and derives the node
//! identity from its subject.

pub mod config;
pub mod connector;
pub mod stream;

pub use config::WebSocketConfig;
pub use connector::RelayConnector;
pub use stream::{RawWebSocket, WsStream};
