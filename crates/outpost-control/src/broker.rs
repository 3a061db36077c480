//! TCP forward broker
//!
//! A TCP forward is two independent upgrades: the request leg dialed by the
//! source node and the response leg dialed by the target node after it was
//! told about the forward on its control tunnel. The broker pairs them by
//! correlation id and bridges them.
//!
//! Per correlation: `AwaitingResponse -> Bridging -> Closed`, or
//! `AwaitingResponse -> TimedOut -> Closed`. The response slot is filled at
//! most once and teardown runs exactly once.

use outpost_bus::EventBus;
use outpost_proto::{NodeIdentity, StartTcpForward};
use outpost_transport::{bridge, close_stream, BridgeStats, DuplexStream, TransportError};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::AdminEvent;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("No response leg within {0:?}")]
    Timeout(Duration),

    #[error("Target instance {0} is no longer connected")]
    TargetOffline(String),

    #[error("Bridge failed: {0}")]
    Bridge(#[from] TransportError),

    #[error("Correlation dropped before a response leg arrived")]
    Abandoned,
}

/// Who asked for the forward and where it goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub source: NodeIdentity,
    pub target: NodeIdentity,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationState {
    AwaitingResponse,
    Bridging,
}

/// Diagnostic view of a pending correlation
#[derive(Debug, Clone)]
pub struct CorrelationInfo {
    pub id: Uuid,
    pub state: CorrelationState,
    pub age: Duration,
    pub target: ForwardTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No correlation with this id
    Unknown,
    /// The response leg was already delivered
    Duplicate,
    /// The correlation timed out while the leg was being handed over
    Expired,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Unknown => write!(f, "unknown correlation"),
            RejectReason::Duplicate => write!(f, "duplicate response leg"),
            RejectReason::Expired => write!(f, "correlation expired"),
        }
    }
}

/// A response leg the broker did not take; the caller must close it
pub struct Rejected<S> {
    pub reason: RejectReason,
    pub stream: S,
}

impl<S> fmt::Debug for Rejected<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish()
    }
}

struct PendingTunnel<S> {
    response_slot: Option<oneshot::Sender<S>>,
    state: CorrelationState,
    created_at: Instant,
    target: ForwardTarget,
}

/// Pairs request and response legs by correlation id
pub struct ForwardBroker<S> {
    pending: Arc<Mutex<HashMap<Uuid, PendingTunnel<S>>>>,
    timeout: Duration,
    events: EventBus<AdminEvent>,
}

impl<S> fmt::Debug for ForwardBroker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardBroker")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<S: DuplexStream> ForwardBroker<S> {
    pub fn new(timeout: Duration, events: EventBus<AdminEvent>) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            events,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Drive one forward from its request leg to teardown.
    ///
    /// `signal` delivers the `start-tcp-forward` notice to the target
    /// instance and reports whether it was accepted.
    pub async fn open<F>(
        &self,
        request: S,
        target: ForwardTarget,
        signal: F,
    ) -> Result<BridgeStats, BrokerError>
    where
        F: FnOnce(StartTcpForward) -> bool,
    {
        let id = Uuid::new_v4();
        let (slot, response) = oneshot::channel();

        self.lock().insert(
            id,
            PendingTunnel {
                response_slot: Some(slot),
                state: CorrelationState::AwaitingResponse,
                created_at: Instant::now(),
                target: target.clone(),
            },
        );
        let mut teardown = Teardown {
            broker: self,
            id,
            error: Some("abandoned".to_string()),
        };

        let notice = StartTcpForward {
            correlation_id: id.to_string(),
            target_instance_id: target.target.instance_id.clone(),
            target_address: target.address.clone(),
            target_port: target.port,
        };

        if !signal(notice) {
            let error = BrokerError::TargetOffline(target.target.instance_id.clone());
            warn!(correlation_id = %id, "{}", error);
            teardown.error = Some(error.to_string());
            drop(teardown);
            close_stream(request).await;
            return Err(error);
        }

        info!(
            correlation_id = %id,
            source = %target.source,
            target = %target.target,
            address = %target.address,
            port = target.port,
            "Forward opened"
        );
        self.events.publish(AdminEvent::ForwardOpened {
            correlation_id: id.to_string(),
            source: target.source.clone(),
            target: target.target.clone(),
            target_address: target.address.clone(),
            target_port: target.port,
        });

        let outcome = match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(response)) => bridge(request, response).await.map_err(BrokerError::from),
            Ok(Err(_)) => {
                close_stream(request).await;
                Err(BrokerError::Abandoned)
            }
            Err(_) => {
                close_stream(request).await;
                Err(BrokerError::Timeout(self.timeout))
            }
        };

        match &outcome {
            Ok(stats) => {
                debug!(
                    correlation_id = %id,
                    up = stats.a_to_b,
                    down = stats.b_to_a,
                    "Forward finished"
                );
                teardown.error = None;
            }
            Err(e) => {
                debug!(correlation_id = %id, "Forward failed: {}", e);
                teardown.error = Some(e.to_string());
            }
        }
        drop(teardown);

        outcome
    }

    /// Hand the response leg to its waiting request leg
    pub fn respond(&self, correlation_id: &str, stream: S) -> Result<(), Rejected<S>> {
        let Ok(id) = Uuid::parse_str(correlation_id) else {
            return Err(Rejected {
                reason: RejectReason::Unknown,
                stream,
            });
        };

        let slot = {
            let mut pending = self.lock();
            let Some(entry) = pending.get_mut(&id) else {
                return Err(Rejected {
                    reason: RejectReason::Unknown,
                    stream,
                });
            };
            let Some(slot) = entry.response_slot.take() else {
                return Err(Rejected {
                    reason: RejectReason::Duplicate,
                    stream,
                });
            };
            entry.state = CorrelationState::Bridging;
            slot
        };

        slot.send(stream).map_err(|stream| Rejected {
            reason: RejectReason::Expired,
            stream,
        })?;

        debug!(correlation_id = %id, "Response leg attached");
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn correlations(&self) -> Vec<CorrelationInfo> {
        self.lock()
            .iter()
            .map(|(id, entry)| CorrelationInfo {
                id: *id,
                state: entry.state,
                age: entry.created_at.elapsed(),
                target: entry.target.clone(),
            })
            .collect()
    }

    fn finish(&self, id: Uuid, error: Option<String>) {
        if self.lock().remove(&id).is_none() {
            return;
        }
        self.events.publish(AdminEvent::ForwardClosed {
            correlation_id: id.to_string(),
            error,
        });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, PendingTunnel<S>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes the correlation when `open` ends, including by cancellation
struct Teardown<'a, S: DuplexStream> {
    broker: &'a ForwardBroker<S>,
    id: Uuid,
    error: Option<String>,
}

impl<S: DuplexStream> Drop for Teardown<'_, S> {
    fn drop(&mut self) {
        self.broker.finish(self.id, self.error.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_transport::IoStream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream as Pipe};

    type Stream = IoStream<Pipe>;

    fn pipe() -> (Stream, Pipe) {
        let (relay_side, node_side) = tokio::io::duplex(1024);
        (IoStream::new(relay_side), node_side)
    }

    fn target() -> ForwardTarget {
        ForwardTarget {
            source: NodeIdentity::new("i1", "cA"),
            target: NodeIdentity::new("i2", "cB"),
            address: "10.0.0.5".to_string(),
            port: 80,
        }
    }

    fn broker(timeout: Duration) -> Arc<ForwardBroker<Stream>> {
        Arc::new(ForwardBroker::new(timeout, EventBus::new()))
    }

    #[tokio::test]
    async fn test_request_and_response_are_bridged() {
        let broker = broker(Duration::from_secs(5));
        let (request, mut source_node) = pipe();
        let (notice_tx, notice_rx) = oneshot::channel();

        let opener = broker.clone();
        let open = tokio::spawn(async move {
            opener
                .open(request, target(), move |notice| notice_tx.send(notice).is_ok())
                .await
        });

        let notice = notice_rx.await.unwrap();
        assert_eq!(notice.target_instance_id, "i2");
        assert_eq!(notice.target_address, "10.0.0.5");
        assert_eq!(notice.target_port, 80);
        let pending = broker.correlations();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, CorrelationState::AwaitingResponse);
        assert_eq!(pending[0].target, target());

        let (response, mut target_node) = pipe();
        broker.respond(&notice.correlation_id, response).unwrap();
        assert_eq!(broker.correlations()[0].state, CorrelationState::Bridging);

        source_node.write_all(b"GET /").await.unwrap();
        let mut buf = [0u8; 5];
        target_node.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /");

        target_node.write_all(b"200 OK").await.unwrap();
        let mut buf = [0u8; 6];
        source_node.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"200 OK");

        drop(source_node);
        let stats = open.await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 5);
        assert_eq!(stats.b_to_a, 6);
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids_are_rejected() {
        let broker = broker(Duration::from_secs(5));

        let (stream, _node) = pipe();
        let rejected = broker.respond("not-a-uuid", stream).unwrap_err();
        assert_eq!(rejected.reason, RejectReason::Unknown);

        let (stream, _node) = pipe();
        let rejected = broker
            .respond(&Uuid::new_v4().to_string(), stream)
            .unwrap_err();
        assert_eq!(rejected.reason, RejectReason::Unknown);
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_second_response_leg_is_rejected() {
        let broker = broker(Duration::from_secs(5));
        let (request, _source_node) = pipe();
        let (notice_tx, notice_rx) = oneshot::channel();

        let opener = broker.clone();
        let open = tokio::spawn(async move {
            opener
                .open(request, target(), move |notice| notice_tx.send(notice).is_ok())
                .await
        });
        let id = notice_rx.await.unwrap().correlation_id;

        let (first, _first_node) = pipe();
        broker.respond(&id, first).unwrap();

        let (second, _second_node) = pipe();
        let rejected = broker.respond(&id, second).unwrap_err();
        assert_eq!(rejected.reason, RejectReason::Duplicate);

        open.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_correlation_once() {
        let broker = broker(Duration::from_secs(60));
        let mut events = broker.events.subscribe_channel();
        let (request, mut source_node) = pipe();

        let result = broker.open(request, target(), |_| true).await;
        assert!(matches!(result, Err(BrokerError::Timeout(_))));
        assert_eq!(broker.pending_count(), 0);

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|event| event.kind())
            .collect();
        assert_eq!(kinds, vec!["forward-opened", "forward-closed"]);

        // The request leg was closed
        let mut buf = Vec::new();
        assert_eq!(source_node.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_target_offline_tears_down() {
        let broker = broker(Duration::from_secs(5));
        let mut events = broker.events.subscribe_channel();
        let (request, _source_node) = pipe();

        let result = broker.open(request, target(), |_| false).await;

        assert!(matches!(result, Err(BrokerError::TargetOffline(_))));
        assert_eq!(broker.pending_count(), 0);
        let event = events.try_recv().unwrap();
        assert!(matches!(event, AdminEvent::ForwardClosed { error: Some(_), .. }));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_open_still_tears_down() {
        let broker = broker(Duration::from_secs(60));
        let (request, _source_node) = pipe();
        let (notice_tx, notice_rx) = oneshot::channel();

        let opener = broker.clone();
        let open = tokio::spawn(async move {
            opener
                .open(request, target(), move |notice| notice_tx.send(notice).is_ok())
                .await
        });
        notice_rx.await.unwrap();
        assert_eq!(broker.pending_count(), 1);

        open.abort();
        let _ = open.await;
        assert_eq!(broker.pending_count(), 0);
    }
}
