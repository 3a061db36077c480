//! WebSocket dialer configuration

use outpost_transport::{TransportError, TransportResult};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Node-side WebSocket configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Client certificate presented to the relay (PEM)
    pub client_cert_path: Option<PathBuf>,

    /// Private key for the client certificate (PEM)
    pub client_key_path: Option<PathBuf>,

    /// CA bundle used to verify the relay; webpki roots when unset
    pub root_ca_path: Option<PathBuf>,

    /// Verify the relay's certificate
    pub verify_server_cert: bool,

    /// Headers added to every upgrade request
    pub extra_headers: Vec<(String, String)>,

    /// Upper bound for establishing a connection
    pub connect_timeout: Duration,

    /// Maximum message size
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::client_default()
    }
}

impl WebSocketConfig {
    /// Create a client configuration with defaults
    pub fn client_default() -> Self {
        Self {
            client_cert_path: None,
            client_key_path: None,
            root_ca_path: None,
            verify_server_cert: true,
            extra_headers: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024, // 16MB
        }
    }

    /// Present a client certificate when dialing the relay
    pub fn with_client_certificate(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    /// Trust this CA bundle instead of the webpki roots
    pub fn with_root_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_ca_path = Some(path.into());
        self
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.verify_server_cert = false;
        self
    }

    /// Add a header to every upgrade request
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        match (&self.client_cert_path, &self.client_key_path) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(TransportError::ConfigurationError(
                    "Client certificate and key must be given together".to_string(),
                ));
            }
            _ => {}
        }

        if self.connect_timeout.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Connect timeout must be greater than zero".to_string(),
            ));
        }

        for (name, _) in &self.extra_headers {
            if name.trim().is_empty() {
                return Err(TransportError::ConfigurationError(
                    "Header name must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Build the rustls client configuration used for wss:// dials
    pub(crate) fn build_tls_config(&self) -> TransportResult<Arc<rustls::ClientConfig>> {
        ensure_crypto_provider();

        let builder = if self.verify_server_cert {
            let mut roots = rustls::RootCertStore::empty();
            match &self.root_ca_path {
                Some(path) => {
                    for cert in load_certs(path)? {
                        roots.add(cert).map_err(|e| {
                            TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                        })?;
                    }
                }
                None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            }
            rustls::ClientConfig::builder().with_root_certificates(roots)
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
        };

        let client_crypto = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(Arc::new(client_crypto))
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> TransportResult<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_client_config_default() {
        let config = WebSocketConfig::client_default();
        assert!(config.verify_server_cert);
        assert!(config.extra_headers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cert_without_key_is_rejected() {
        let mut config = WebSocketConfig::client_default();
        config.client_cert_path = Some(PathBuf::from("node.crt"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_header_name_is_rejected() {
        let config = WebSocketConfig::client_default().with_header(" ", "x");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_insecure_config_builds_without_files() {
        let config = WebSocketConfig::client_default().with_insecure_skip_verify();
        assert!(config.build_tls_config().is_ok());
    }

    #[test]
    fn test_missing_client_cert_file_is_tls_error() {
        let config = WebSocketConfig::client_default()
            .with_client_certificate("/nonexistent/node.crt", "/nonexistent/node.key");
        assert!(matches!(
            config.build_tls_config(),
            Err(TransportError::TlsError(_))
        ));
    }

    #[test]
    fn test_ca_file_without_certificates_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a pem file").unwrap();

        let config = WebSocketConfig::client_default().with_root_ca(file.path());
        assert!(config.build_tls_config().is_err());
    }
}
