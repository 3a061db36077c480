//! Relay errors and their HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use outpost_proto::IdentityError;
use thiserror::Error;

/// Reasons an upgrade request is refused before any state is touched
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Instance {0} is not connected")]
    SourceNotLive(String),

    #[error("Instance {instance_id} does not belong to certificate {certificate_id}")]
    CertificateMismatch {
        instance_id: String,
        certificate_id: String,
    },

    #[error("Instance {0} is already connected")]
    InstanceConflict(String),

    #[error("Node {0} has no live instance")]
    TargetOffline(String),
}

impl HandlerError {
    pub fn status(&self) -> StatusCode {
        match self {
            HandlerError::Identity(IdentityError::MissingCertificate) => StatusCode::UNAUTHORIZED,
            HandlerError::Identity(_) => StatusCode::FORBIDDEN,
            HandlerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HandlerError::SourceNotLive(_) | HandlerError::CertificateMismatch { .. } => {
                StatusCode::FORBIDDEN
            }
            HandlerError::InstanceConflict(_) => StatusCode::CONFLICT,
            HandlerError::TargetOffline(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            HandlerError::Identity(IdentityError::MissingCertificate).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            HandlerError::Identity(IdentityError::NotEncrypted).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            HandlerError::Identity(IdentityError::EmptyCertificateId).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            HandlerError::TargetOffline("cB".to_string()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HandlerError::InstanceConflict("i1".to_string()).status(),
            StatusCode::CONFLICT
        );
    }
}
