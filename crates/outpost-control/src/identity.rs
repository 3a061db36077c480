//! Caller identity from the client certificate
//!
//! TLS is terminated in front of the relay. The terminator verifies the
//! node's client certificate and forwards its subject in request headers,
//! which this extractor turns into a [`PeerCertificate`].

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use outpost_proto::{CertificateSubject, IdentityError};
use tracing::debug;

use crate::error::HandlerError;

/// Scheme the client used to reach the terminator
pub const HEADER_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Verification result; `SUCCESS` when a valid certificate was presented
pub const HEADER_CLIENT_VERIFY: &str = "x-client-verify";
pub const HEADER_CLIENT_CERT_O: &str = "x-client-cert-o";
pub const HEADER_CLIENT_CERT_OU: &str = "x-client-cert-ou";
pub const HEADER_CLIENT_CERT_CN: &str = "x-client-cert-cn";
/// Certificate expiry, RFC 3339
pub const HEADER_CLIENT_CERT_NOT_AFTER: &str = "x-client-cert-not-after";
pub const HEADER_FORWARDED_FOR: &str = "x-forwarded-for";

const VERIFY_SUCCESS: &str = "SUCCESS";

/// Verified client certificate of the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    pub subject: CertificateSubject,
    /// Address of the connecting node as seen by the terminator
    pub remote_addr: Option<String>,
}

impl PeerCertificate {
    /// Read the certificate from forwarded headers.
    ///
    /// A missing certificate is checked first, then the transport, then the
    /// certificate id.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, IdentityError> {
        let verified = header(headers, HEADER_CLIENT_VERIFY)
            .is_some_and(|value| value.eq_ignore_ascii_case(VERIFY_SUCCESS));
        if !verified {
            return Err(IdentityError::MissingCertificate);
        }

        let encrypted = header(headers, HEADER_FORWARDED_PROTO).is_some_and(|proto| {
            proto.eq_ignore_ascii_case("https") || proto.eq_ignore_ascii_case("wss")
        });
        if !encrypted {
            return Err(IdentityError::NotEncrypted);
        }

        let subject = CertificateSubject {
            organization: header(headers, HEADER_CLIENT_CERT_O).unwrap_or_default().to_string(),
            organizational_unit: header(headers, HEADER_CLIENT_CERT_OU)
                .unwrap_or_default()
                .to_string(),
            common_name: header(headers, HEADER_CLIENT_CERT_CN).unwrap_or_default().to_string(),
            not_after: header(headers, HEADER_CLIENT_CERT_NOT_AFTER).and_then(parse_not_after),
        };

        if subject.organizational_unit.trim().is_empty() {
            return Err(IdentityError::EmptyCertificateId);
        }

        let remote_addr = header(headers, HEADER_FORWARDED_FOR)
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string);

        Ok(Self {
            subject,
            remote_addr,
        })
    }

    pub fn certificate_id(&self) -> &str {
        self.subject.organizational_unit.trim()
    }
}

impl<S> FromRequestParts<S> for PeerCertificate
where
    S: Send + Sync,
{
    type Rejection = HandlerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_headers(&parts.headers).map_err(|e| {
            debug!(path = %parts.uri.path(), "Rejecting caller: {}", e);
            HandlerError::Identity(e)
        })
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_not_after(value: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(parsed) => Some(parsed.with_timezone(&Utc)),
        Err(e) => {
            debug!(value, "Ignoring unparsable certificate expiry: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn verified() -> Vec<(&'static str, &'static str)> {
        vec![
            (HEADER_CLIENT_VERIFY, "SUCCESS"),
            (HEADER_FORWARDED_PROTO, "https"),
            (HEADER_CLIENT_CERT_O, "acme"),
            (HEADER_CLIENT_CERT_OU, "cA"),
            (HEADER_CLIENT_CERT_CN, "edge-1"),
        ]
    }

    #[test]
    fn test_full_subject() {
        let mut pairs = verified();
        pairs.push((HEADER_CLIENT_CERT_NOT_AFTER, "2030-01-01T00:00:00Z"));
        pairs.push((HEADER_FORWARDED_FOR, "203.0.113.7, 10.0.0.1"));

        let peer = PeerCertificate::from_headers(&headers(&pairs)).unwrap();
        assert_eq!(peer.certificate_id(), "cA");
        assert_eq!(peer.subject.organization, "acme");
        assert_eq!(peer.subject.common_name, "edge-1");
        assert_eq!(
            peer.subject.not_after.unwrap().to_rfc3339(),
            "2030-01-01T00:00:00+00:00"
        );
        assert_eq!(peer.remote_addr.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_missing_certificate() {
        let result = PeerCertificate::from_headers(&headers(&[(HEADER_FORWARDED_PROTO, "https")]));
        assert_eq!(result, Err(IdentityError::MissingCertificate));

        let result = PeerCertificate::from_headers(&headers(&[
            (HEADER_CLIENT_VERIFY, "NONE"),
            (HEADER_FORWARDED_PROTO, "https"),
        ]));
        assert_eq!(result, Err(IdentityError::MissingCertificate));
    }

    #[test]
    fn test_plain_transport_is_rejected() {
        let pairs: Vec<_> = verified()
            .into_iter()
            .map(|(name, value)| {
                if name == HEADER_FORWARDED_PROTO {
                    (name, "http")
                } else {
                    (name, value)
                }
            })
            .collect();
        let result = PeerCertificate::from_headers(&headers(&pairs));
        assert_eq!(result, Err(IdentityError::NotEncrypted));
    }

    #[test]
    fn test_empty_organizational_unit_is_rejected() {
        let pairs: Vec<_> = verified()
            .into_iter()
            .filter(|(name, _)| *name != HEADER_CLIENT_CERT_OU)
            .collect();
        let result = PeerCertificate::from_headers(&headers(&pairs));
        assert_eq!(result, Err(IdentityError::EmptyCertificateId));
    }

    #[test]
    fn test_bad_expiry_is_ignored() {
        let mut pairs = verified();
        pairs.push((HEADER_CLIENT_CERT_NOT_AFTER, "next tuesday"));
        let peer = PeerCertificate::from_headers(&headers(&pairs)).unwrap();
        assert!(peer.subject.not_after.is_none());
        assert!(peer.remote_addr.is_none());
    }
}
