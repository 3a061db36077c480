//! UDP forwarding on the node
//!
//! Datagrams have no tunnel of their own. The source node wraps each one in a
//! `udp-forward-request` on its control tunnel; the target node replays it
//! from a fresh socket, waits for a single reply and sends it back as a
//! `udp-forward-response`, which the source hands to the listener socket of
//! the rule it came from.

use async_trait::async_trait;
use outpost_bus::MailboxReader;
use outpost_proto::{
    join_host_port, ControlMessage, ForwardRule, UdpForwardRequest, UdpForwardResponse,
    MAX_UDP_PAYLOAD,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::control::ControlHandle;
use crate::manager::RuleStatus;

/// Listener sockets of the running UDP rules, by rule id
#[derive(Clone, Default)]
pub struct UdpSocketTable {
    sockets: Arc<Mutex<HashMap<String, Arc<UdpSocket>>>>,
}

impl UdpSocketTable {
    pub fn insert(&self, rule_id: &str, socket: Arc<UdpSocket>) {
        self.lock().insert(rule_id.to_string(), socket);
    }

    pub fn get(&self, rule_id: &str) -> Option<Arc<UdpSocket>> {
        self.lock().get(rule_id).cloned()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<UdpSocket>>> {
        self.sockets.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Receive loop of one UDP rule
pub(crate) async fn serve_socket(
    socket: Arc<UdpSocket>,
    rule: Arc<ForwardRule>,
    control: ControlHandle,
    status: RuleStatus,
) {
    let mut buffer = vec![0u8; MAX_UDP_PAYLOAD];
    loop {
        let (len, peer) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                warn!(rule_id = %rule.id, "UDP receive failed: {}", e);
                status.record_error(format!("receive failed: {}", e));
                return;
            }
        };

        let request = UdpForwardRequest {
            rule_id: rule.id.to_string(),
            source_instance_id: control.instance_id().unwrap_or_default(),
            source_address: peer.to_string(),
            target_node_id: rule.target_node_id.clone(),
            target_instance_id: None,
            target_address: rule.target_address.clone(),
            target_port: rule.target_port,
            data: buffer[..len].to_vec(),
        };
        if !control.send(ControlMessage::UdpForwardRequest(request)) {
            trace!(rule_id = %rule.id, peer = %peer, "Dropped datagram");
        }
    }
}

/// Replays datagrams addressed to this node and returns the reply
pub struct UdpTerminator {
    control: ControlHandle,
    reply_timeout: Duration,
}

impl UdpTerminator {
    pub fn new(control: ControlHandle, reply_timeout: Duration) -> Self {
        Self {
            control,
            reply_timeout,
        }
    }

    async fn exchange(&self, request: &UdpForwardRequest) -> io::Result<Vec<u8>> {
        let endpoint = join_host_port(&request.target_address, request.target_port);
        let target = tokio::net::lookup_host(&endpoint)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve", endpoint))
            })?;

        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;
        socket.send(&request.data).await?;

        let mut buffer = vec![0u8; MAX_UDP_PAYLOAD];
        let len = tokio::time::timeout(self.reply_timeout, socket.recv(&mut buffer))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply"))??;
        buffer.truncate(len);
        Ok(buffer)
    }
}

#[async_trait]
impl MailboxReader<ControlMessage, String> for UdpTerminator {
    async fn on_message(&self, message: ControlMessage, _from: String) {
        let ControlMessage::UdpForwardRequest(request) = message else {
            return;
        };

        if let Some(target) = request.target_instance_id.as_deref() {
            if self.control.instance_id().as_deref() != Some(target) {
                debug!(rule_id = %request.rule_id, "Ignoring datagram for another instance");
                return;
            }
        }

        match self.exchange(&request).await {
            Ok(reply) => {
                self.control
                    .send(ControlMessage::UdpForwardResponse(request.reply(reply)));
            }
            Err(e) => debug!(
                rule_id = %request.rule_id,
                target = %join_host_port(&request.target_address, request.target_port),
                "Dropping datagram: {}",
                e
            ),
        }
    }
}

/// Hands replies to the listener socket of the originating rule
pub struct UdpDelivery {
    sockets: UdpSocketTable,
}

impl UdpDelivery {
    pub fn new(sockets: UdpSocketTable) -> Self {
        Self { sockets }
    }

    async fn deliver(&self, response: UdpForwardResponse) {
        let Some(socket) = self.sockets.get(&response.rule_id) else {
            debug!(rule_id = %response.rule_id, "No listener for UDP reply");
            return;
        };
        let peer: SocketAddr = match response.source_address.parse() {
            Ok(peer) => peer,
            Err(_) => {
                debug!(
                    rule_id = %response.rule_id,
                    "Invalid source address {}", response.source_address
                );
                return;
            }
        };
        if let Err(e) = socket.send_to(&response.data, peer).await {
            debug!(rule_id = %response.rule_id, peer = %peer, "UDP reply failed: {}", e);
        }
    }
}

#[async_trait]
impl MailboxReader<ControlMessage, String> for UdpDelivery {
    async fn on_message(&self, message: ControlMessage, _from: String) {
        if let ControlMessage::UdpForwardResponse(response) = message {
            self.deliver(response).await;
        }
    }
}
