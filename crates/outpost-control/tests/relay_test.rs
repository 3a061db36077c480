//! Relay integration tests
//!
//! A real relay is served on 127.0.0.1:0. Nodes are simulated with the
//! node-side dialer; the TLS terminator is simulated by injecting the
//! certificate headers it would forward.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use outpost_control::identity::{
    HEADER_CLIENT_CERT_CN, HEADER_CLIENT_CERT_O, HEADER_CLIENT_CERT_OU, HEADER_CLIENT_VERIFY,
    HEADER_FORWARDED_FOR, HEADER_FORWARDED_PROTO,
};
use outpost_control::{relay_router, AdminEvent, MemoryStore, RelaySettings, RelayState};
use outpost_proto::{ControlMessage, ForwardRequestQuery, UdpForwardRequest};
use outpost_transport::{ChunkRead, ChunkWrite, DuplexStream, TransportError};
use outpost_transport_websocket::{RawWebSocket, RelayConnector, WebSocketConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;
use url::Url;

async fn start_relay(settings: RelaySettings) -> (SocketAddr, RelayState) {
    let state = RelayState::new(Arc::new(MemoryStore::new()), settings).unwrap();
    let app = relay_router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

fn node_connector(addr: SocketAddr, certificate_id: &str) -> RelayConnector {
    let config = WebSocketConfig::client_default()
        .with_header(HEADER_CLIENT_VERIFY, "SUCCESS")
        .with_header(HEADER_FORWARDED_PROTO, "https")
        .with_header(HEADER_CLIENT_CERT_O, "acme")
        .with_header(HEADER_CLIENT_CERT_OU, certificate_id)
        .with_header(HEADER_CLIENT_CERT_CN, format!("{certificate_id}-host"))
        .with_header(HEADER_FORWARDED_FOR, "203.0.113.7");
    let base = Url::parse(&format!("ws://{addr}")).unwrap();
    RelayConnector::new(base, Arc::new(config)).unwrap()
}

/// Open a control tunnel and wait until the relay lists the instance
async fn connect_node(
    state: &RelayState,
    connector: &RelayConnector,
    instance_id: &str,
) -> RawWebSocket {
    let ws = connector.connect_control(instance_id).await.unwrap();
    wait_until(|| {
        state.registry.find_instance(instance_id).is_some() && state.bus.contains(instance_id)
    })
    .await;
    ws
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn next_control(ws: &mut RawWebSocket) -> ControlMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a control frame")
            .expect("control tunnel closed")
            .expect("control tunnel error");
        if let Message::Text(text) = frame {
            return ControlMessage::from_json(&text).unwrap();
        }
    }
}

async fn send_control(ws: &mut RawWebSocket, message: ControlMessage) {
    ws.send(Message::Text(message.to_json().unwrap()))
        .await
        .unwrap();
}

/// Nothing arrives on `ws` for a short while
async fn assert_silent(ws: &mut RawWebSocket) {
    let result = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(result.is_err(), "unexpected frame: {result:?}");
}

fn forward_query(instance: &str, node: &str) -> ForwardRequestQuery {
    ForwardRequestQuery {
        instance: instance.to_string(),
        node: node.to_string(),
        addr: "10.0.0.5".to_string(),
        port: 80,
    }
}

#[tokio::test]
async fn test_tcp_forward_reaches_only_the_target_and_bridges() {
    let (addr, state) = start_relay(RelaySettings::default()).await;
    let node_a = node_connector(addr, "cA");
    let node_b = node_connector(addr, "cB");
    let node_c = node_connector(addr, "cC");
    let _control_a = connect_node(&state, &node_a, "i1").await;
    let mut control_b = connect_node(&state, &node_b, "i2").await;
    let mut control_c = connect_node(&state, &node_c, "i3").await;

    let request_leg = node_a
        .open_forward_request(&forward_query("i1", "cB"))
        .await
        .unwrap();

    let notice = match next_control(&mut control_b).await {
        ControlMessage::StartTcpForward(notice) => notice,
        other => panic!("unexpected message: {other:?}"),
    };
    assert_eq!(notice.target_instance_id, "i2");
    assert_eq!(notice.target_address, "10.0.0.5");
    assert_eq!(notice.target_port, 80);
    assert_silent(&mut control_c).await;
    assert_eq!(state.broker.pending_count(), 1);

    let response_leg = node_b
        .open_forward_response(&notice.correlation_id)
        .await
        .unwrap();

    let (mut a_read, mut a_write) = request_leg.split();
    let (mut b_read, mut b_write) = response_leg.split();

    a_write.write_chunk(b"GET /").await.unwrap();
    assert_eq!(&b_read.read_chunk().await.unwrap().unwrap()[..], b"GET /");

    b_write.write_chunk(b"200 OK").await.unwrap();
    assert_eq!(&a_read.read_chunk().await.unwrap().unwrap()[..], b"200 OK");

    a_write.close().await.unwrap();
    wait_until(|| state.broker.pending_count() == 0).await;
}

#[tokio::test]
async fn test_offline_target_is_rejected_before_correlation() {
    let (addr, state) = start_relay(RelaySettings::default()).await;
    let node_a = node_connector(addr, "cA");
    let _control_a = connect_node(&state, &node_a, "i1").await;
    let mut events = state.events.subscribe_channel();

    let err = node_a
        .open_forward_request(&forward_query("i1", "cB"))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::ConnectionError(ref m) if m.contains("404")));
    assert_eq!(state.broker.pending_count(), 0);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(
            event,
            AdminEvent::ForwardOpened { .. } | AdminEvent::ForwardClosed { .. }
        ));
    }
}

#[tokio::test]
async fn test_request_leg_must_come_from_own_instance() {
    let (addr, state) = start_relay(RelaySettings::default()).await;
    let node_a = node_connector(addr, "cA");
    let node_b = node_connector(addr, "cB");
    let _control_a = connect_node(&state, &node_a, "i1").await;
    let _control_b = connect_node(&state, &node_b, "i2").await;

    // cB tries to originate a forward as cA's instance
    let err = node_b
        .open_forward_request(&forward_query("i1", "cB"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionError(ref m) if m.contains("403")));

    // Unknown source instance
    let err = node_a
        .open_forward_request(&forward_query("i9", "cB"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionError(ref m) if m.contains("403")));
    assert_eq!(state.broker.pending_count(), 0);
}

#[tokio::test]
async fn test_unknown_response_leg_is_closed() {
    let (addr, state) = start_relay(RelaySettings::default()).await;
    let node_b = node_connector(addr, "cB");

    let leg = node_b
        .open_forward_response("7d0c1f7e-0000-4000-8000-000000000000")
        .await
        .unwrap();
    let (mut reader, _writer) = leg.split();

    let end = tokio::time::timeout(Duration::from_secs(5), reader.read_chunk())
        .await
        .unwrap();
    assert!(matches!(end, Ok(None) | Err(_)));
    assert_eq!(state.broker.pending_count(), 0);
}

#[tokio::test]
async fn test_second_response_leg_is_closed() {
    let (addr, state) = start_relay(RelaySettings::default()).await;
    let node_a = node_connector(addr, "cA");
    let node_b = node_connector(addr, "cB");
    let _control_a = connect_node(&state, &node_a, "i1").await;
    let mut control_b = connect_node(&state, &node_b, "i2").await;

    let _request_leg = node_a
        .open_forward_request(&forward_query("i1", "cB"))
        .await
        .unwrap();
    let ControlMessage::StartTcpForward(notice) = next_control(&mut control_b).await else {
        panic!("expected start-tcp-forward");
    };

    let _first = node_b
        .open_forward_response(&notice.correlation_id)
        .await
        .unwrap();
    let second = node_b
        .open_forward_response(&notice.correlation_id)
        .await
        .unwrap();

    let (mut reader, _writer) = second.split();
    let end = tokio::time::timeout(Duration::from_secs(5), reader.read_chunk())
        .await
        .unwrap();
    assert!(matches!(end, Ok(None) | Err(_)));
    assert_eq!(state.broker.pending_count(), 1);
}

#[tokio::test]
async fn test_unanswered_forward_times_out_once() {
    let settings = RelaySettings {
        forward_timeout: Duration::from_millis(200),
        ..RelaySettings::default()
    };
    let (addr, state) = start_relay(settings).await;
    let node_a = node_connector(addr, "cA");
    let node_b = node_connector(addr, "cB");
    let _control_a = connect_node(&state, &node_a, "i1").await;
    let _control_b = connect_node(&state, &node_b, "i2").await;
    let mut events = state.events.subscribe_channel();

    let request_leg = node_a
        .open_forward_request(&forward_query("i1", "cB"))
        .await
        .unwrap();
    let (mut reader, _writer) = request_leg.split();

    let end = tokio::time::timeout(Duration::from_secs(5), reader.read_chunk())
        .await
        .unwrap();
    assert!(matches!(end, Ok(None) | Err(_)));
    wait_until(|| state.broker.pending_count() == 0).await;

    let mut closed = 0;
    while let Ok(event) = events.try_recv() {
        if let AdminEvent::ForwardClosed { error, .. } = event {
            assert!(error.unwrap().contains("No response leg"));
            closed += 1;
        }
    }
    assert_eq!(closed, 1);
}

#[tokio::test]
async fn test_udp_request_and_response_are_routed() {
    let (addr, state) = start_relay(RelaySettings::default()).await;
    let node_a = node_connector(addr, "cA");
    let node_b = node_connector(addr, "cB");
    let mut control_a = connect_node(&state, &node_a, "i1").await;
    let mut control_b = connect_node(&state, &node_b, "i2").await;

    send_control(
        &mut control_a,
        ControlMessage::UdpForwardRequest(UdpForwardRequest {
            rule_id: "r1".to_string(),
            source_instance_id: "forged".to_string(),
            source_address: "127.0.0.1:5000".to_string(),
            target_node_id: "cB".to_string(),
            target_instance_id: None,
            target_address: "127.0.0.1".to_string(),
            target_port: 53,
            data: vec![0, 1, 2, 255],
        }),
    )
    .await;

    let request = match next_control(&mut control_b).await {
        ControlMessage::UdpForwardRequest(request) => request,
        other => panic!("unexpected message: {other:?}"),
    };
    assert_eq!(request.source_instance_id, "i1");
    assert_eq!(request.target_instance_id.as_deref(), Some("i2"));
    assert_eq!(request.data, vec![0, 1, 2, 255]);

    send_control(
        &mut control_b,
        ControlMessage::UdpForwardResponse(request.reply(b"pong".to_vec())),
    )
    .await;

    match next_control(&mut control_a).await {
        ControlMessage::UdpForwardResponse(response) => {
            assert_eq!(response.rule_id, "r1");
            assert_eq!(response.source_address, "127.0.0.1:5000");
            assert_eq!(response.data, b"pong");
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn test_ping_is_answered() {
    let (addr, state) = start_relay(RelaySettings::default()).await;
    let node_a = node_connector(addr, "cA");
    let mut control = connect_node(&state, &node_a, "i1").await;

    send_control(&mut control, ControlMessage::Ping { timestamp: 42 }).await;
    assert_eq!(
        next_control(&mut control).await,
        ControlMessage::Pong { timestamp: 42 }
    );
}

#[tokio::test]
async fn test_disconnect_marks_node_offline() {
    let (addr, state) = start_relay(RelaySettings::default()).await;
    let node_a = node_connector(addr, "cA");
    let mut control = connect_node(&state, &node_a, "i1").await;
    assert!(state.registry.is_online("cA"));
    assert_eq!(state.registry.node("cA").unwrap().display_name, "cA-host");

    control.close(None).await.unwrap();
    wait_until(|| !state.registry.is_online("cA")).await;
    wait_until(|| state.bus.is_empty()).await;

    let node = state.registry.node("cA").unwrap();
    assert_eq!(node.last_address.as_deref(), Some("203.0.113.7"));
    assert!(node.last_offline_at.unwrap() >= node.last_online_at.unwrap());
}

#[tokio::test]
async fn test_duplicate_instance_is_conflict() {
    let (addr, state) = start_relay(RelaySettings::default()).await;
    let node_a = node_connector(addr, "cA");
    let _control = connect_node(&state, &node_a, "i1").await;

    let err = node_a.connect_control("i1").await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectionError(ref m) if m.contains("409")));
    assert_eq!(state.registry.live_instance_count(), 1);
}

#[tokio::test]
async fn test_silent_control_tunnel_goes_offline() {
    let settings = RelaySettings {
        control_idle_timeout: Duration::from_millis(300),
        ..RelaySettings::default()
    };
    let (addr, state) = start_relay(settings).await;
    let node_a = node_connector(addr, "cA");
    let mut events = state.events.subscribe_channel();

    // Never sends anything, like a node that vanished behind a NAT
    let _control = connect_node(&state, &node_a, "i1").await;

    wait_until(|| !state.registry.is_online("cA")).await;
    wait_until(|| state.bus.is_empty()).await;
    state.registry.node_delete("cA").unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind());
    }
    assert!(kinds.contains(&"instance-offline"));
    assert!(kinds.contains(&"node-offline"));
}

#[tokio::test]
async fn test_pinging_control_tunnel_stays_online() {
    let settings = RelaySettings {
        control_idle_timeout: Duration::from_millis(300),
        ..RelaySettings::default()
    };
    let (addr, state) = start_relay(settings).await;
    let node_a = node_connector(addr, "cA");
    let mut control = connect_node(&state, &node_a, "i1").await;

    for timestamp in 0..8 {
        send_control(&mut control, ControlMessage::Ping { timestamp }).await;
        assert_eq!(
            next_control(&mut control).await,
            ControlMessage::Pong { timestamp }
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(state.registry.is_online("cA"));
}

#[tokio::test]
async fn test_identity_rejections() {
    let state = RelayState::new(Arc::new(MemoryStore::new()), RelaySettings::default()).unwrap();

    let response = relay_router(state.clone())
        .oneshot(
            Request::builder()
                .uri("/node/connect?instance=i1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = relay_router(state.clone())
        .oneshot(
            Request::builder()
                .uri("/node/connect?instance=i1")
                .header(HEADER_CLIENT_VERIFY, "SUCCESS")
                .header(HEADER_FORWARDED_PROTO, "http")
                .header(HEADER_CLIENT_CERT_OU, "cA")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = relay_router(state.clone())
        .oneshot(
            Request::builder()
                .uri("/fwd/request?instance=i1&node=cB&addr=10.0.0.5&port=80")
                .header(HEADER_CLIENT_VERIFY, "SUCCESS")
                .header(HEADER_FORWARDED_PROTO, "https")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    assert_eq!(state.registry.live_instance_count(), 0);
    assert!(state.registry.nodes().is_empty());
}
