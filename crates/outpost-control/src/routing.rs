//! Routing of control messages received from nodes
//!
//! UDP forwarding has no per-flow tunnel: requests and responses travel over
//! the control tunnels and the relay forwards them between mailboxes.

use async_trait::async_trait;
use outpost_bus::{MailboxReader, MessageBus};
use outpost_proto::{ControlMessage, NodeIdentity, UdpForwardRequest, UdpForwardResponse};
use tracing::{debug, trace, warn};

use crate::registry::NodeRegistry;

/// Reader installed on the relay's message bus
pub struct ControlRouter {
    registry: NodeRegistry,
    bus: MessageBus<ControlMessage, NodeIdentity>,
}

impl ControlRouter {
    pub fn new(registry: NodeRegistry, bus: MessageBus<ControlMessage, NodeIdentity>) -> Self {
        Self { registry, bus }
    }

    /// Send a request to the target node's current instance.
    /// The return address is always the sending tunnel.
    fn route_request(&self, mut request: UdpForwardRequest, from: &NodeIdentity) -> bool {
        let Some(target) = self.registry.resolve_instance(&request.target_node_id) else {
            debug!(
                rule_id = %request.rule_id,
                target_node_id = %request.target_node_id,
                "Dropping UDP request for offline node"
            );
            return false;
        };

        let target_instance_id = target.identity.instance_id;
        request.target_instance_id = Some(target_instance_id.clone());
        request.source_instance_id = from.instance_id.clone();

        trace!(
            rule_id = %request.rule_id,
            source_instance_id = %from.instance_id,
            target_instance_id = %target_instance_id,
            bytes = request.data.len(),
            "Routing UDP request"
        );
        self.bus.unicast(
            ControlMessage::UdpForwardRequest(request),
            &target_instance_id,
        )
    }

    fn route_response(&self, response: UdpForwardResponse, from: &NodeIdentity) -> bool {
        let source_instance_id = response.source_instance_id.clone();
        trace!(
            rule_id = %response.rule_id,
            from = %from,
            source_instance_id = %source_instance_id,
            bytes = response.data.len(),
            "Routing UDP response"
        );
        let delivered = self.bus.unicast(
            ControlMessage::UdpForwardResponse(response),
            &source_instance_id,
        );
        if !delivered {
            debug!(
                source_instance_id = %source_instance_id,
                "Dropping UDP response, source instance gone"
            );
        }
        delivered
    }
}

#[async_trait]
impl MailboxReader<ControlMessage, NodeIdentity> for ControlRouter {
    async fn on_message(&self, message: ControlMessage, from: NodeIdentity) {
        match message {
            ControlMessage::UdpForwardRequest(request) => {
                self.route_request(request, &from);
            }
            ControlMessage::UdpForwardResponse(response) => {
                self.route_response(response, &from);
            }
            ControlMessage::Ping { timestamp } => {
                self.bus
                    .unicast(ControlMessage::Pong { timestamp }, &from.instance_id);
            }
            ControlMessage::Pong { .. } => trace!(from = %from, "Pong"),
            ControlMessage::StartTcpForward(_) => {
                warn!(from = %from, "Ignoring start-tcp-forward sent by a node");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AdminEvent;
    use crate::registry::InstanceMetadata;
    use crate::store::MemoryStore;
    use outpost_bus::EventBus;
    use outpost_proto::CertificateSubject;
    use std::sync::Arc;

    fn setup() -> (ControlRouter, MessageBus<ControlMessage, NodeIdentity>, NodeRegistry) {
        let events: EventBus<AdminEvent> = EventBus::new();
        let registry = NodeRegistry::load(Arc::new(MemoryStore::new()), events).unwrap();
        let bus = MessageBus::new(16);
        (
            ControlRouter::new(registry.clone(), bus.clone()),
            bus,
            registry,
        )
    }

    fn online(registry: &NodeRegistry, identity: &NodeIdentity) {
        registry
            .node_online(
                identity,
                InstanceMetadata {
                    remote_addr: "203.0.113.7".to_string(),
                    protocol_version: 1,
                    subject: CertificateSubject {
                        organizational_unit: identity.certificate_id.clone(),
                        ..Default::default()
                    },
                },
            )
            .unwrap();
    }

    fn request() -> UdpForwardRequest {
        UdpForwardRequest {
            rule_id: "r1".to_string(),
            source_instance_id: "spoofed".to_string(),
            source_address: "127.0.0.1:5000".to_string(),
            target_node_id: "cB".to_string(),
            target_instance_id: None,
            target_address: "10.0.0.5".to_string(),
            target_port: 53,
            data: b"query".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_request_goes_to_latest_target_instance() {
        let (router, bus, registry) = setup();
        let source = NodeIdentity::new("i1", "cA");
        let old_target = NodeIdentity::new("i2", "cB");
        let new_target = NodeIdentity::new("i3", "cB");
        online(&registry, &source);
        online(&registry, &old_target);
        online(&registry, &new_target);
        let mut old_box = bus.create_mailbox(old_target.clone());
        let mut new_box = bus.create_mailbox(new_target.clone());

        router.on_message(ControlMessage::UdpForwardRequest(request()), source.clone()).await;

        match new_box.recv().await {
            Some(ControlMessage::UdpForwardRequest(routed)) => {
                assert_eq!(routed.target_instance_id.as_deref(), Some("i3"));
                assert_eq!(routed.source_instance_id, "i1");
                assert_eq!(routed.data, b"query");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        bus.close_mailbox(old_box.id());
        assert!(old_box.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_request_to_offline_node_is_dropped() {
        let (router, bus, _registry) = setup();
        let source = NodeIdentity::new("i1", "cA");
        let mut source_box = bus.create_mailbox(source.clone());

        assert!(!router.route_request(request(), &source));
        bus.close_mailbox(source_box.id());
        assert!(source_box.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_response_returns_to_source_instance() {
        let (router, bus, _registry) = setup();
        let mut source_box = bus.create_mailbox(NodeIdentity::new("i1", "cA"));
        let target = NodeIdentity::new("i2", "cB");

        let mut routed = request();
        routed.source_instance_id = "i1".to_string();
        let response = routed.reply(b"answer".to_vec());

        router
            .on_message(ControlMessage::UdpForwardResponse(response.clone()), target)
            .await;

        assert_eq!(
            source_box.recv().await,
            Some(ControlMessage::UdpForwardResponse(response))
        );
    }

    #[tokio::test]
    async fn test_ping_is_answered_on_the_same_tunnel() {
        let (router, bus, _registry) = setup();
        let node = NodeIdentity::new("i1", "cA");
        let mut mailbox = bus.create_mailbox(node.clone());

        router
            .on_message(ControlMessage::Ping { timestamp: 7 }, node)
            .await;

        assert_eq!(
            mailbox.recv().await,
            Some(ControlMessage::Pong { timestamp: 7 })
        );
    }
}
