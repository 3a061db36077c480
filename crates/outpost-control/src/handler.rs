//! Relay upgrade endpoints
//!
//! - `GET /node/connect`: a node's control tunnel
//! - `GET /fwd/request`: request leg of a TCP forward, dialed by the source
//! - `GET /fwd/response`: response leg, dialed by the target
//!
//! Every check happens before the upgrade so a rejected caller never touches
//! relay state. A control tunnel that stays silent longer than
//! `control_idle_timeout` is closed and its instance goes offline.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use outpost_bus::{EventBus, MessageBus};
use outpost_proto::{
    ConnectQuery, ControlMessage, ForwardRequestQuery, ForwardResponseQuery, NodeIdentity,
    CONNECT_PATH, FORWARD_REQUEST_PATH, FORWARD_RESPONSE_PATH, PROTOCOL_VERSION,
};
use outpost_transport::close_stream;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broker::{ForwardBroker, ForwardTarget};
use crate::error::HandlerError;
use crate::events::AdminEvent;
use crate::identity::PeerCertificate;
use crate::registry::{InstanceMetadata, NodeRegistry, RegistryError};
use crate::routing::ControlRouter;
use crate::store::ConfigStore;
use crate::tunnel::WsTunnel;
use crate::RelaySettings;

/// Shared relay state handed to every endpoint
#[derive(Clone)]
pub struct RelayState {
    pub registry: NodeRegistry,
    pub bus: MessageBus<ControlMessage, NodeIdentity>,
    pub broker: Arc<ForwardBroker<WsTunnel>>,
    pub events: EventBus<AdminEvent>,
    pub settings: RelaySettings,
}

impl RelayState {
    /// Load the node catalog and wire the bus, router and broker together
    pub fn new(
        store: Arc<dyn ConfigStore>,
        settings: RelaySettings,
    ) -> Result<Self, RegistryError> {
        let events = EventBus::new();
        let registry = NodeRegistry::load(store, events.clone())?;
        let bus = MessageBus::new(settings.mailbox_capacity);
        bus.add_reader(ControlRouter::new(registry.clone(), bus.clone()));
        let broker = Arc::new(ForwardBroker::new(settings.forward_timeout, events.clone()));

        Ok(Self {
            registry,
            bus,
            broker,
            events,
            settings,
        })
    }
}

/// Router serving the three upgrade endpoints
pub fn relay_router(state: RelayState) -> Router {
    Router::new()
        .route(CONNECT_PATH, get(connect_handler))
        .route(FORWARD_REQUEST_PATH, get(forward_request_handler))
        .route(FORWARD_RESPONSE_PATH, get(forward_response_handler))
        .with_state(state)
}

async fn connect_handler(
    State(state): State<RelayState>,
    peer: PeerCertificate,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, HandlerError> {
    let identity = NodeIdentity::from_certificate(&peer.subject, query.instance.as_deref())?;

    if state.registry.find_instance(&identity.instance_id).is_some() {
        return Err(HandlerError::InstanceConflict(identity.instance_id));
    }

    let metadata = InstanceMetadata {
        remote_addr: peer
            .remote_addr
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        protocol_version: PROTOCOL_VERSION,
        subject: peer.subject,
    };

    Ok(ws.on_upgrade(move |socket| run_control_tunnel(state, identity, metadata, socket)))
}

/// Serve one control tunnel until the node goes away
async fn run_control_tunnel(
    state: RelayState,
    identity: NodeIdentity,
    metadata: InstanceMetadata,
    mut socket: WebSocket,
) {
    // A concurrent connect may have claimed the id after the pre-upgrade check
    if let Err(e) = state.registry.node_online(&identity, metadata) {
        warn!(instance_id = %identity.instance_id, "Refusing control tunnel: {}", e);
        let _ = socket.close().await;
        return;
    }

    let (mut sink, mut source) = socket.split();
    let mut mailbox = state.bus.create_mailbox(identity.clone());
    let mailbox_id = mailbox.id();

    let writer_identity = identity.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = mailbox.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        instance_id = %writer_identity.instance_id,
                        "Failed to encode {}: {}",
                        message.kind(),
                        e
                    );
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(
                    instance_id = %writer_identity.instance_id,
                    "Control tunnel write failed: {}", e
                );
                break;
            }
        }
        let _ = sink.close().await;
    });

    let idle_timeout = state.settings.control_idle_timeout;
    loop {
        let frame = match tokio::time::timeout(idle_timeout, source.next()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(_) => {
                info!(
                    instance_id = %identity.instance_id,
                    "Control tunnel silent for {:?}, closing", idle_timeout
                );
                break;
            }
        };
        match frame {
            Ok(Message::Text(text)) => match ControlMessage::from_json(text.as_str()) {
                Ok(message) => {
                    state.bus.dispatch_inbound(message, identity.clone());
                }
                Err(e) => {
                    debug!(
                        instance_id = %identity.instance_id,
                        "Ignoring malformed control frame: {}", e
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(
                    instance_id = %identity.instance_id,
                    "Control tunnel read failed: {}", e
                );
                break;
            }
        }
    }

    state.bus.close_mailbox(mailbox_id);
    writer.abort();
    state.registry.node_offline(&identity);
}

async fn forward_request_handler(
    State(state): State<RelayState>,
    peer: PeerCertificate,
    Query(query): Query<ForwardRequestQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, HandlerError> {
    if query.addr.trim().is_empty() || query.port == 0 {
        return Err(HandlerError::BadRequest(
            "addr and a non-zero port are required".to_string(),
        ));
    }

    let source = state
        .registry
        .find_instance(&query.instance)
        .ok_or_else(|| HandlerError::SourceNotLive(query.instance.clone()))?;
    if source.identity.certificate_id != peer.certificate_id() {
        return Err(HandlerError::CertificateMismatch {
            instance_id: query.instance,
            certificate_id: peer.certificate_id().to_string(),
        });
    }

    let target = state
        .registry
        .resolve_instance(&query.node)
        .ok_or_else(|| HandlerError::TargetOffline(query.node.clone()))?;

    let forward = ForwardTarget {
        source: source.identity,
        target: target.identity,
        address: query.addr,
        port: query.port,
    };

    Ok(ws.on_upgrade(move |socket| async move {
        let bus = state.bus.clone();
        let target_instance_id = forward.target.instance_id.clone();
        let result = state
            .broker
            .open(WsTunnel::new(socket), forward, move |notice| {
                bus.unicast(ControlMessage::StartTcpForward(notice), &target_instance_id)
            })
            .await;

        if let Err(e) = result {
            debug!("TCP forward ended: {}", e);
        }
    }))
}

async fn forward_response_handler(
    State(state): State<RelayState>,
    _peer: PeerCertificate,
    Query(query): Query<ForwardResponseQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(rejected) = state.broker.respond(&query.id, WsTunnel::new(socket)) {
            info!(correlation_id = %query.id, "Closing response leg: {}", rejected.reason);
            close_stream(rejected.stream).await;
        }
    })
}
