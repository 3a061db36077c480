//! Node identity derived from a mutual-TLS client certificate
//!
//! A node is known by two ids. The certificate id comes from the
//! certificate's organizational unit and never changes for a physical node.
//! The instance id names one live control tunnel and changes on every
//! reconnect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("Client certificate is missing")]
    MissingCertificate,

    #[error("Connection is not encrypted")]
    NotEncrypted,

    #[error("Client certificate has an empty organizational unit")]
    EmptyCertificateId,
}

/// Subject fields of a verified client certificate
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSubject {
    /// Account the node belongs to
    pub organization: String,
    /// Stable certificate id
    pub organizational_unit: String,
    /// Default display name
    pub common_name: String,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    pub instance_id: String,
    pub certificate_id: String,
}

impl NodeIdentity {
    pub fn new(instance_id: impl Into<String>, certificate_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            certificate_id: certificate_id.into(),
        }
    }

    /// Derive the identity of a freshly accepted control tunnel.
    ///
    /// The instance id is the one the node asked for, else the certificate's
    /// common name, else a new UUID.
    pub fn from_certificate(
        subject: &CertificateSubject,
        requested_instance: Option<&str>,
    ) -> Result<Self, IdentityError> {
        let certificate_id = subject.organizational_unit.trim();
        if certificate_id.is_empty() {
            return Err(IdentityError::EmptyCertificateId);
        }

        let instance_id = requested_instance
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .or_else(|| Some(subject.common_name.trim()).filter(|cn| !cn.is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self::new(instance_id, certificate_id))
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.certificate_id, self.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(ou: &str, cn: &str) -> CertificateSubject {
        CertificateSubject {
            organization: "acme".to_string(),
            organizational_unit: ou.to_string(),
            common_name: cn.to_string(),
            not_after: None,
        }
    }

    #[test]
    fn test_requested_instance_wins() {
        let identity = NodeIdentity::from_certificate(&subject("cA", "edge-1"), Some("i1")).unwrap();
        assert_eq!(identity, NodeIdentity::new("i1", "cA"));
    }

    #[test]
    fn test_falls_back_to_common_name() {
        let identity = NodeIdentity::from_certificate(&subject("cA", "edge-1"), Some("  ")).unwrap();
        assert_eq!(identity.instance_id, "edge-1");
    }

    #[test]
    fn test_generates_instance_when_nothing_given() {
        let first = NodeIdentity::from_certificate(&subject("cA", ""), None).unwrap();
        let second = NodeIdentity::from_certificate(&subject("cA", ""), None).unwrap();
        assert_eq!(first.certificate_id, "cA");
        assert_ne!(first.instance_id, second.instance_id);
    }

    #[test]
    fn test_empty_certificate_id_is_rejected() {
        let result = NodeIdentity::from_certificate(&subject(" ", "edge-1"), Some("i1"));
        assert_eq!(result, Err(IdentityError::EmptyCertificateId));
    }
}
