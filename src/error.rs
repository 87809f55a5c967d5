use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::saml::{MetadataError, ValidationFailure};

/// Errors surfaced by the HTTP layer.
///
/// Responses carry a stable code and a generic message; the detail stays in
/// the logs.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The IdP metadata could not be loaded after retries, or the circuit is open.
    #[error("identity provider unavailable: {0}")]
    IdentityProviderUnavailable(#[source] MetadataError),

    /// The SAML response was rejected.
    #[error("SAML response rejected: {0}")]
    Validation(#[from] ValidationFailure),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<MetadataError> for AuthError {
    fn from(error: MetadataError) -> Self {
        Self::IdentityProviderUnavailable(error)
    }
}

/// `{"error": {"type": ..., "message": ..., "code": ...}}`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub message: &'static str,
    pub code: &'static str,
}

impl ErrorResponse {
    pub fn new(error_type: &'static str, code: &'static str, message: &'static str) -> Self {
        Self {
            error: ErrorInfo {
                error_type,
                message,
                code,
            },
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AuthError::Validation(failure) => {
                // Same shape as a failed /validate: {"valid": false, "error", "code"}
                return (StatusCode::UNAUTHORIZED, Json(*failure)).into_response();
            }
            AuthError::IdentityProviderUnavailable(error) => {
                tracing::warn!(error = %error, "Identity provider unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorResponse::new(
                        "dependency_error",
                        "idp_unavailable",
                        "Identity provider unavailable",
                    ),
                )
            }
            AuthError::Internal(message) => {
                tracing::error!(error = %message, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("internal_error", "internal_error", "Internal server error"),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
