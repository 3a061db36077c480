//! TCP forwarding on the node
//!
//! Source side: a listener per enabled TCP rule. Every accepted connection
//! dials a request leg at the relay and is bridged to it.
//!
//! Target side: a `start-tcp-forward` notice makes the node dial the target
//! address, then the response leg, and bridge the two.

use async_trait::async_trait;
use outpost_bus::MailboxReader;
use outpost_proto::{
    join_host_port, ControlMessage, ForwardRequestQuery, ForwardRule, StartTcpForward,
};
use outpost_transport::{bridge, IoStream};
use outpost_transport_websocket::RelayConnector;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::control::ControlHandle;
use crate::manager::RuleStatus;

/// Upper bound for dialing a target on behalf of a remote node
const TARGET_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept, so a persistent error such as EMFILE does
/// not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept loop of one TCP rule
pub(crate) async fn serve_listener(
    listener: TcpListener,
    rule: Arc<ForwardRule>,
    control: ControlHandle,
    connector: RelayConnector,
    status: RuleStatus,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(rule_id = %rule.id, peer = %peer, "Accepted TCP connection");
                tokio::spawn(originate(
                    stream,
                    rule.clone(),
                    control.clone(),
                    connector.clone(),
                ));
            }
            Err(e) => accept_failed(&rule, &status, e).await,
        }
    }
}

async fn accept_failed(rule: &ForwardRule, status: &RuleStatus, error: std::io::Error) {
    warn!(rule_id = %rule.id, "Failed to accept TCP connection: {}", error);
    status.record_error(format!("accept failed: {}", error));
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

/// Carry one local connection to the rule's target through the relay
async fn originate(
    stream: TcpStream,
    rule: Arc<ForwardRule>,
    control: ControlHandle,
    connector: RelayConnector,
) {
    let Some(instance_id) = control.instance_id() else {
        debug!(rule_id = %rule.id, "Control tunnel down, closing local connection");
        return;
    };

    let query = ForwardRequestQuery {
        instance: instance_id,
        node: rule.target_node_id.clone(),
        addr: rule.target_address.clone(),
        port: rule.target_port,
    };
    let leg = match connector.open_forward_request(&query).await {
        Ok(leg) => leg,
        Err(e) => {
            warn!(
                rule_id = %rule.id,
                target_node_id = %rule.target_node_id,
                "Failed to open request leg: {}",
                e
            );
            return;
        }
    };

    match bridge(IoStream::new(stream), leg).await {
        Ok(stats) => debug!(
            rule_id = %rule.id,
            sent = stats.a_to_b,
            received = stats.b_to_a,
            "TCP forward finished"
        ),
        Err(e) => debug!(rule_id = %rule.id, "TCP forward ended: {}", e),
    }
}

/// Serves `start-tcp-forward` notices addressed to this node
pub struct TcpResponder {
    connector: RelayConnector,
    control: ControlHandle,
}

impl TcpResponder {
    pub fn new(connector: RelayConnector, control: ControlHandle) -> Self {
        Self { connector, control }
    }

    async fn respond(&self, notice: StartTcpForward) {
        let endpoint = join_host_port(&notice.target_address, notice.target_port);
        let target = match tokio::time::timeout(
            TARGET_CONNECT_TIMEOUT,
            TcpStream::connect(&endpoint),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(
                    correlation_id = %notice.correlation_id,
                    "Failed to reach {}: {}", endpoint, e
                );
                return;
            }
            Err(_) => {
                warn!(
                    correlation_id = %notice.correlation_id,
                    "Timed out reaching {}", endpoint
                );
                return;
            }
        };

        let leg = match self
            .connector
            .open_forward_response(&notice.correlation_id)
            .await
        {
            Ok(leg) => leg,
            Err(e) => {
                warn!(
                    correlation_id = %notice.correlation_id,
                    "Failed to open response leg: {}", e
                );
                return;
            }
        };

        info!(
            correlation_id = %notice.correlation_id,
            target = %endpoint,
            "Serving TCP forward"
        );
        if let Err(e) = bridge(IoStream::new(target), leg).await {
            debug!(correlation_id = %notice.correlation_id, "TCP forward ended: {}", e);
        }
    }
}

#[async_trait]
impl MailboxReader<ControlMessage, String> for TcpResponder {
    async fn on_message(&self, message: ControlMessage, _from: String) {
        let ControlMessage::StartTcpForward(notice) = message else {
            return;
        };

        let current = self.control.instance_id();
        if current.as_deref() != Some(notice.target_instance_id.as_str()) {
            debug!(
                correlation_id = %notice.correlation_id,
                target_instance_id = %notice.target_instance_id,
                "Ignoring forward notice for another instance"
            );
            return;
        }

        self.respond(notice).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_proto::{ForwardProtocol, RuleId};

    fn rule() -> ForwardRule {
        ForwardRule {
            id: RuleId::from("r1"),
            enabled: true,
            protocol: ForwardProtocol::Tcp,
            listen_address: "127.0.0.1".to_string(),
            listen_port: 0,
            target_node_id: "cB".to_string(),
            target_address: "10.0.0.5".to_string(),
            target_port: 80,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_backs_off() {
        let status = RuleStatus::default();
        let started = tokio::time::Instant::now();

        accept_failed(&rule(), &status, std::io::Error::from_raw_os_error(24)).await;

        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
        assert!(status.last_error().unwrap().starts_with("accept failed"));
    }
}
