//! Upgrade endpoints exposed by the relay and their query strings

use serde::{Deserialize, Serialize};
use url::Url;

/// Establishes a node's standing control tunnel
pub const CONNECT_PATH: &str = "/node/connect";

/// Opens the request leg of a TCP forward
pub const FORWARD_REQUEST_PATH: &str = "/fwd/request";

/// Opens the response leg of a TCP forward
pub const FORWARD_RESPONSE_PATH: &str = "/fwd/response";

/// `GET /node/connect?instance=<id>`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectQuery {
    #[serde(default)]
    pub instance: Option<String>,
}

/// `GET /fwd/request?instance=<src>&node=<dstCert>&addr=<addr>&port=<port>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardRequestQuery {
    /// Instance id of the initiating node
    pub instance: String,
    /// Certificate id of the target node
    pub node: String,
    pub addr: String,
    pub port: u16,
}

/// `GET /fwd/response?id=<correlationId>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardResponseQuery {
    pub id: String,
}

impl ConnectQuery {
    /// Full URL of the connect endpoint below `base`
    pub fn to_url(&self, base: &Url) -> Url {
        let mut url = join_path(base, CONNECT_PATH);
        if let Some(instance) = &self.instance {
            url.query_pairs_mut().append_pair("instance", instance);
        }
        url
    }
}

impl ForwardRequestQuery {
    pub fn to_url(&self, base: &Url) -> Url {
        let mut url = join_path(base, FORWARD_REQUEST_PATH);
        url.query_pairs_mut()
            .append_pair("instance", &self.instance)
            .append_pair("node", &self.node)
            .append_pair("addr", &self.addr)
            .append_pair("port", &self.port.to_string());
        url
    }
}

impl ForwardResponseQuery {
    pub fn to_url(&self, base: &Url) -> Url {
        let mut url = join_path(base, FORWARD_RESPONSE_PATH);
        url.query_pairs_mut().append_pair("id", &self.id);
        url
    }
}

// The relay may be mounted below a prefix, e.g. `wss://relay.example.com/outpost`
fn join_path(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{}{}", prefix, path));
    url.set_query(None);
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_url() {
        let base = Url::parse("wss://relay.example.com").unwrap();
        let url = ConnectQuery {
            instance: Some("i-1".to_string()),
        }
        .to_url(&base);
        assert_eq!(url.as_str(), "wss://relay.example.com/node/connect?instance=i-1");
    }

    #[test]
    fn test_request_url_keeps_prefix_and_escapes() {
        let base = Url::parse("wss://relay.example.com/outpost/").unwrap();
        let url = ForwardRequestQuery {
            instance: "i 1".to_string(),
            node: "cB".to_string(),
            addr: "10.0.0.5".to_string(),
            port: 80,
        }
        .to_url(&base);
        assert_eq!(url.path(), "/outpost/fwd/request");
        assert_eq!(
            url.query(),
            Some("instance=i+1&node=cB&addr=10.0.0.5&port=80")
        );
    }

    #[test]
    fn test_response_url() {
        let base = Url::parse("ws://127.0.0.1:8080").unwrap();
        let url = ForwardResponseQuery {
            id: "abc".to_string(),
        }
        .to_url(&base);
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/fwd/response?id=abc");
    }
}
