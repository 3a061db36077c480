//! Admin notifications published on the relay's event bus

use outpost_proto::NodeIdentity;
use serde::Serialize;

/// Node lifecycle and forward notices for admin consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AdminEvent {
    /// A certificate was seen online for the first time
    NodeRegistered {
        certificate_id: String,
        display_name: String,
    },
    /// First live instance of a node
    NodeOnline { certificate_id: String },
    /// Last live instance of a node went away
    NodeOffline { certificate_id: String },
    InstanceOnline {
        identity: NodeIdentity,
        remote_addr: String,
    },
    InstanceOffline { identity: NodeIdentity },
    NodeModified {
        certificate_id: String,
        display_name: String,
        remark: String,
    },
    NodeRevoked { certificate_id: String },
    ForwardOpened {
        correlation_id: String,
        source: NodeIdentity,
        target: NodeIdentity,
        target_address: String,
        target_port: u16,
    },
    ForwardClosed {
        correlation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl AdminEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AdminEvent::NodeRegistered { .. } => "node-registered",
            AdminEvent::NodeOnline { .. } => "node-online",
            AdminEvent::NodeOffline { .. } => "node-offline",
            AdminEvent::InstanceOnline { .. } => "instance-online",
            AdminEvent::InstanceOffline { .. } => "instance-offline",
            AdminEvent::NodeModified { .. } => "node-modified",
            AdminEvent::NodeRevoked { .. } => "node-revoked",
            AdminEvent::ForwardOpened { .. } => "forward-opened",
            AdminEvent::ForwardClosed { .. } => "forward-closed",
        }
    }
}
