//! Control message types
//!
//! Every message exchanged over a node's control tunnel is a JSON text frame
//! shaped as `{"kind": "...", "payload": {...}}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while encoding or decoding control frames
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Invalid control frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),
}

/// Main control tunnel message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Keepalive sent by the node
    Ping { timestamp: u64 },
    /// Relay answer to a keepalive
    Pong { timestamp: u64 },
    /// Relay asks the target node to open the response leg of a TCP forward
    StartTcpForward(StartTcpForward),
    /// A datagram travelling from the source node towards the target node
    UdpForwardRequest(UdpForwardRequest),
    /// The reply datagram travelling back to the source node
    UdpForwardResponse(UdpForwardResponse),
}

impl ControlMessage {
    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Pong { .. } => "pong",
            ControlMessage::StartTcpForward(_) => "start-tcp-forward",
            ControlMessage::UdpForwardRequest(_) => "udp-forward-request",
            ControlMessage::UdpForwardResponse(_) => "udp-forward-response",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartTcpForward {
    pub correlation_id: String,
    /// Instance the relay routed this message to
    pub target_instance_id: String,
    pub target_address: String,
    pub target_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UdpForwardRequest {
    pub rule_id: String,
    pub source_instance_id: String,
    /// Address of the local client that sent the datagram, `ip:port`
    pub source_address: String,
    /// Certificate id of the node that should terminate the datagram
    pub target_node_id: String,
    /// Filled in by the relay once the target node has been resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_instance_id: Option<String>,
    pub target_address: String,
    pub target_port: u16,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UdpForwardResponse {
    pub rule_id: String,
    pub source_instance_id: String,
    pub source_address: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl UdpForwardRequest {
    /// Build the response that carries `data` back to the originating listener
    pub fn reply(&self, data: Vec<u8>) -> UdpForwardResponse {
        UdpForwardResponse {
            rule_id: self.rule_id.clone(),
            source_instance_id: self.source_instance_id.clone(),
            source_address: self.source_address.clone(),
            data,
        }
    }
}

// Datagram payloads travel as base64 strings inside JSON
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
