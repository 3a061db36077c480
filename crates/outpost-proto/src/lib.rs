//! Outpost Protocol Definitions
//!
//! This crate defines the wire types shared by the relay and its nodes:
//! the control message envelope carried over a node's control tunnel, the
//! upgrade endpoints and their query strings, node identity, and the
//! forwarding rule model.

pub mod endpoints;
pub mod identity;
pub mod messages;
pub mod rules;

pub use endpoints::{
    ConnectQuery, ForwardRequestQuery, ForwardResponseQuery, CONNECT_PATH, FORWARD_REQUEST_PATH,
    FORWARD_RESPONSE_PATH,
};
pub use identity::{CertificateSubject, IdentityError, NodeIdentity};
pub use messages::*;
pub use rules::{
    join_host_port, ForwardProtocol, ForwardRule, ForwardRuleDraft, RuleError, RuleId, RuleSet,
};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest payload a single UDP datagram can carry
pub const MAX_UDP_PAYLOAD: usize = 65_535;

/// How long the relay waits for the response leg of a TCP forward
pub const FORWARD_RESPONSE_TIMEOUT_SECS: u64 = 60;

/// Interval between node pings on the control tunnel
pub const KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// A control tunnel silent for this long is treated as gone
pub const CONTROL_IDLE_TIMEOUT_SECS: u64 = 3 * KEEPALIVE_INTERVAL_SECS;
