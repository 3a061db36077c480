//! Forwarding rule model
//!
//! A rule maps a local listen address on the node that owns it to a target
//! address reachable from another node. Rule ids are minted once when the
//! rule is first saved and are never reused.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("Rule {0} not found")]
    NotFound(RuleId),

    #[error("{protocol} listen address {address}:{port} is already used by rule {existing}")]
    DuplicateListenAddress {
        protocol: ForwardProtocol,
        address: String,
        port: u16,
        existing: RuleId,
    },

    #[error("Invalid rule: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    /// Mint a fresh id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RuleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RuleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for ForwardProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardProtocol::Tcp => f.write_str("tcp"),
            ForwardProtocol::Udp => f.write_str("udp"),
        }
    }
}

impl std::str::FromStr for ForwardProtocol {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ForwardProtocol::Tcp),
            "udp" => Ok(ForwardProtocol::Udp),
            other => Err(RuleError::Invalid(format!("unknown protocol '{}'", other))),
        }
    }
}

/// One declared forward
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRule {
    pub id: RuleId,
    pub enabled: bool,
    pub protocol: ForwardProtocol,
    pub listen_address: String,
    pub listen_port: u16,
    /// Certificate id of the node that reaches the target
    pub target_node_id: String,
    pub target_address: String,
    pub target_port: u16,
}

/// A rule before it has been saved and given an id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRuleDraft {
    pub enabled: bool,
    pub protocol: ForwardProtocol,
    pub listen_address: String,
    pub listen_port: u16,
    pub target_node_id: String,
    pub target_address: String,
    pub target_port: u16,
}

impl ForwardRuleDraft {
    fn validate(&self) -> Result<(), RuleError> {
        if self.listen_address.trim().is_empty() {
            return Err(RuleError::Invalid("listen address cannot be empty".to_string()));
        }
        if self.target_node_id.trim().is_empty() {
            return Err(RuleError::Invalid("target node cannot be empty".to_string()));
        }
        if self.target_address.trim().is_empty() {
            return Err(RuleError::Invalid("target address cannot be empty".to_string()));
        }
        if self.target_port == 0 {
            return Err(RuleError::Invalid("target port cannot be 0".to_string()));
        }
        Ok(())
    }

    fn into_rule(self, id: RuleId) -> ForwardRule {
        ForwardRule {
            id,
            enabled: self.enabled,
            protocol: self.protocol,
            listen_address: self.listen_address,
            listen_port: self.listen_port,
            target_node_id: self.target_node_id,
            target_address: self.target_address,
            target_port: self.target_port,
        }
    }
}

impl ForwardRule {
    /// `listen_address:listen_port`, suitable for binding
    pub fn listen_endpoint(&self) -> String {
        join_host_port(&self.listen_address, self.listen_port)
    }

    /// `target_address:target_port`, suitable for dialing
    pub fn target_endpoint(&self) -> String {
        join_host_port(&self.target_address, self.target_port)
    }

    fn listens_like(&self, draft: &ForwardRuleDraft) -> bool {
        self.protocol == draft.protocol
            && self.listen_port == draft.listen_port
            && self.listen_address == draft.listen_address
    }
}

/// Join a host and port, bracketing bare IPv6 addresses
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// The rules owned by one node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct RuleSet {
    rules: Vec<ForwardRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a new rule and mint its id
    pub fn insert(&mut self, draft: ForwardRuleDraft) -> Result<RuleId, RuleError> {
        draft.validate()?;
        self.check_listen_conflict(&draft, None)?;

        let id = RuleId::generate();
        self.rules.push(draft.into_rule(id.clone()));
        Ok(id)
    }

    /// Replace the fields of an existing rule, keeping its id
    pub fn update(&mut self, id: &RuleId, draft: ForwardRuleDraft) -> Result<(), RuleError> {
        draft.validate()?;
        self.check_listen_conflict(&draft, Some(id))?;

        let slot = self
            .rules
            .iter_mut()
            .find(|rule| &rule.id == id)
            .ok_or_else(|| RuleError::NotFound(id.clone()))?;
        *slot = draft.into_rule(id.clone());
        Ok(())
    }

    pub fn set_enabled(&mut self, id: &RuleId, enabled: bool) -> Result<(), RuleError> {
        let rule = self
            .rules
            .iter_mut()
            .find(|rule| &rule.id == id)
            .ok_or_else(|| RuleError::NotFound(id.clone()))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn remove(&mut self, id: &RuleId) -> Result<ForwardRule, RuleError> {
        let index = self
            .rules
            .iter()
            .position(|rule| &rule.id == id)
            .ok_or_else(|| RuleError::NotFound(id.clone()))?;
        Ok(self.rules.remove(index))
    }

    pub fn get(&self, id: &RuleId) -> Option<&ForwardRule> {
        self.rules.iter().find(|rule| &rule.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ForwardRule> {
        self.rules.iter()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ForwardRule> {
        self.rules.iter().filter(|rule| rule.enabled)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn check_listen_conflict(
        &self,
        draft: &ForwardRuleDraft,
        ignore: Option<&RuleId>,
    ) -> Result<(), RuleError> {
        match self
            .rules
            .iter()
            .filter(|rule| Some(&rule.id) != ignore)
            .find(|rule| rule.listens_like(draft))
        {
            Some(existing) => Err(RuleError::DuplicateListenAddress {
                protocol: draft.protocol,
                address: draft.listen_address.clone(),
                port: draft.listen_port,
                existing: existing.id.clone(),
            }),
            None => Ok(()),
        }
    }
}
