//! Error taxonomy shared by the hub, the terminal registry and the HTTP layer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Every failure in this crate is scoped to one connection or one session.
#[derive(Debug, Error)]
pub enum LiveError {
    /// Bad, missing or expired identity token.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The terminal target cannot be reached.
    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    /// The session process could not be started.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// The client went away. Normal teardown.
    #[error("transport closed")]
    TransportClosed,

    /// The session process exited abnormally.
    #[error("process crashed: {0}")]
    ProcessCrashed(String),

    /// A push buffer overflowed and the policy closed the connection.
    #[error("push buffer overflow on connection {0}")]
    Overflow(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already attached: {0}")]
    AlreadyAttached(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type LiveResult<T> = Result<T, LiveError>;

impl LiveError {
    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            LiveError::AuthFailed(_) => "AUTH_FAILED",
            LiveError::HostUnreachable(_) => "HOST_UNREACHABLE",
            LiveError::SpawnFailed(_) => "SPAWN_FAILED",
            LiveError::TransportClosed => "TRANSPORT_CLOSED",
            LiveError::ProcessCrashed(_) => "PROCESS_CRASHED",
            LiveError::Overflow(_) => "OVERFLOW",
            LiveError::NotFound(_) => "NOT_FOUND",
            LiveError::AlreadyAttached(_) => "ALREADY_ATTACHED",
            LiveError::InvalidRequest(_) => "INVALID_REQUEST",
            LiveError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            LiveError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            LiveError::HostUnreachable(_) => StatusCode::BAD_GATEWAY,
            LiveError::SpawnFailed(_) | LiveError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            LiveError::ProcessCrashed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LiveError::TransportClosed => StatusCode::GONE,
            LiveError::Overflow(_) => StatusCode::SERVICE_UNAVAILABLE,
            LiveError::NotFound(_) => StatusCode::NOT_FOUND,
            LiveError::AlreadyAttached(_) => StatusCode::CONFLICT,
            LiveError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
            code: Some(self.code().to_string()),
        }
    }
}

/// Error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    /// Error message
    pub error: String,
    /// Error code (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for LiveError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(LiveError::AuthFailed("x".into()).code(), "AUTH_FAILED");
        assert_eq!(
            LiveError::HostUnreachable("h1".into()).code(),
            "HOST_UNREACHABLE"
        );
        assert_eq!(LiveError::SpawnFailed("x".into()).code(), "SPAWN_FAILED");
        assert_eq!(LiveError::TransportClosed.code(), "TRANSPORT_CLOSED");
    }

    #[test]
    fn auth_failure_maps_to_401() {
        let err = LiveError::AuthFailed("expired".into());
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn body_carries_code_and_message() {
        let body = LiveError::AlreadyAttached("s1".into()).body();
        assert_eq!(body.code.as_deref(), Some("ALREADY_ATTACHED"));
        assert!(body.error.contains("s1"));

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "ALREADY_ATTACHED");
    }
}
