//! Caller-visible failure categories for the HTTP surface.
//!
//! Every handler error collapses into one of these before it reaches the
//! wire. Bodies are `{"error": "<code>"}`; request-shape problems also carry
//! a `detail` string. Credential and token failures never do.

use crate::auth::CredentialError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Body could not be decoded into the expected shape.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Unknown user or wrong password. Deliberately one variant.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Missing, malformed, mis-signed or expired bearer token.
    #[error("unauthorized")]
    Unauthorized,
    /// Token was valid but the connection could not be upgraded.
    #[error("connection upgrade failed: {0}")]
    UpgradeFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Unauthorized => "unauthorized",
            Self::UpgradeFailed(_) => "upgrade_failed",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidCredentials | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::UpgradeFailed(_) => StatusCode::UPGRADE_REQUIRED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CredentialError> for GatewayError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::EmptyField(field) => {
                Self::InvalidRequest(format!("{field} must not be empty"))
            }
            CredentialError::Hash(msg) | CredentialError::Storage(msg) => Self::Internal(msg),
        }
    }
}

impl From<tokio::task::JoinError> for GatewayError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("worker task failed: {err}"))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = match &self {
            Self::InvalidRequest(detail) | Self::UpgradeFailed(detail) => {
                serde_json::json!({"error": self.code(), "detail": detail})
            }
            Self::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed with internal error");
                serde_json::json!({"error": self.code()})
            }
            _ => serde_json::json!({"error": self.code()}),
        };
        (self.status(), Json(body)).into_response()
    }
}
