//! Outpost relay
//!
//! The relay is the only publicly reachable component. Nodes dial it, and it
//! never dials them back. It keeps:
//!
//! - the [`NodeRegistry`]: persisted node catalog plus live control tunnels
//! - a [`MessageBus`](outpost_bus::MessageBus) with one mailbox per control
//!   tunnel, over which TCP forward notices and UDP datagrams travel
//! - the [`ForwardBroker`], which pairs the two legs of each TCP forward by
//!   correlation id and bridges them
//!
//! [`relay_router`] exposes all of it as axum upgrade endpoints.

pub mod broker;
pub mod error;
pub mod events;
pub mod handler;
pub mod identity;
pub mod registry;
pub mod routing;
pub mod store;
pub mod tunnel;

pub use broker::{BrokerError, ForwardBroker, ForwardTarget, RejectReason, Rejected};
pub use error::HandlerError;
pub use events::AdminEvent;
pub use handler::{relay_router, RelayState};
pub use identity::PeerCertificate;
pub use registry::{InstanceMetadata, LiveInstance, NodeChanges, NodeRegistry, RegistryError};
pub use routing::ControlRouter;
pub use store::{
    ConfigStore, JsonFileStore, MemoryStore, RegisteredNode, RelayConfigFile, StoreError,
};
pub use tunnel::WsTunnel;

use outpost_bus::DEFAULT_MAILBOX_CAPACITY;
use outpost_proto::{CONTROL_IDLE_TIMEOUT_SECS, FORWARD_RESPONSE_TIMEOUT_SECS};
use std::time::Duration;

/// Relay tuning knobs
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// How long a request leg waits for its response leg
    pub forward_timeout: Duration,
    /// Outbound queue size of each control tunnel
    pub mailbox_capacity: usize,
    /// A control tunnel that sends nothing for this long is closed. Nodes
    /// ping well within it, so only dead peers hit it.
    pub control_idle_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            forward_timeout: Duration::from_secs(FORWARD_RESPONSE_TIMEOUT_SECS),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            control_idle_timeout: Duration::from_secs(CONTROL_IDLE_TIMEOUT_SECS),
        }
    }
}
