//! Outbound dialer for the relay's upgrade endpoints

use outpost_proto::{ConnectQuery, ForwardRequestQuery, ForwardResponseQuery};
use outpost_transport::{TransportError, TransportResult};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as ProtocolConfig;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::Connector;
use tracing::debug;
use url::Url;

use crate::config::WebSocketConfig;
use crate::stream::{RawWebSocket, WsStream};

/// Dials the relay. Every tunnel is a separate outbound WebSocket.
#[derive(Debug, Clone)]
pub struct RelayConnector {
    base: Url,
    config: Arc<WebSocketConfig>,
    tls: Arc<rustls::ClientConfig>,
}

impl RelayConnector {
    pub fn new(base: Url, config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        match base.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::ConfigurationError(format!(
                    "Relay URL must use ws:// or wss://, got {}://",
                    other
                )));
            }
        }
        config.validate()?;
        let tls = config.build_tls_config()?;

        Ok(Self { base, config, tls })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Open the control tunnel for this connection attempt
    pub async fn connect_control(&self, instance_id: &str) -> TransportResult<RawWebSocket> {
        let url = ConnectQuery {
            instance: Some(instance_id.to_string()),
        }
        .to_url(&self.base);
        self.dial(url).await
    }

    /// Open the request leg of a TCP forward
    pub async fn open_forward_request(
        &self,
        query: &ForwardRequestQuery,
    ) -> TransportResult<WsStream> {
        let url = query.to_url(&self.base);
        Ok(WsStream::new(self.dial(url).await?))
    }

    /// Open the response leg of a TCP forward
    pub async fn open_forward_response(&self, correlation_id: &str) -> TransportResult<WsStream> {
        let url = ForwardResponseQuery {
            id: correlation_id.to_string(),
        }
        .to_url(&self.base);
        Ok(WsStream::new(self.dial(url).await?))
    }

    async fn dial(&self, url: Url) -> TransportResult<RawWebSocket> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid URL: {}", e)))?;

        for (name, value) in &self.config.extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::ConfigurationError(format!("Invalid header name: {}", e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                TransportError::ConfigurationError(format!("Invalid header value: {}", e))
            })?;
            request.headers_mut().insert(name, value);
        }

        let mut protocol = ProtocolConfig::default();
        protocol.max_message_size = Some(self.config.max_message_size);

        debug!(url = %url, "Dialing relay");

        let dial = tokio_tungstenite::connect_async_tls_with_config(
            request,
            Some(protocol),
            true,
            Some(Connector::Rustls(self.tls.clone())),
        );

        let (ws, response) = tokio::time::timeout(self.config.connect_timeout, dial)
            .await
            .map_err(|_| TransportError::ConnectionError(format!("Timed out dialing {}", url)))?
            .map_err(map_dial_error)?;

        debug!(url = %url, status = %response.status(), "Relay upgrade accepted");
        Ok(ws)
    }
}

fn map_dial_error(error: WsError) -> TransportError {
    match error {
        WsError::Http(response) => TransportError::ConnectionError(format!(
            "Upgrade rejected with status {}",
            response.status()
        )),
        WsError::Io(e) => TransportError::IoError(e),
        WsError::Tls(e) => TransportError::TlsError(e.to_string()),
        e => TransportError::WebSocketError(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_websocket_scheme() {
        let base = Url::parse("https://relay.example.com").unwrap();
        let result = RelayConnector::new(base, Arc::new(WebSocketConfig::client_default()));
        assert!(matches!(
            result,
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_accepts_plain_and_tls_schemes() {
        for base in ["ws://127.0.0.1:8080", "wss://relay.example.com/outpost"] {
            let base = Url::parse(base).unwrap();
            let connector =
                RelayConnector::new(base.clone(), Arc::new(WebSocketConfig::client_default()))
                    .unwrap();
            assert_eq!(connector.base_url(), &base);
        }
    }
}
