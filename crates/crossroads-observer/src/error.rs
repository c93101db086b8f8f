//! Error types for the Observer API server.
//!
//! [`ObserverError`] unifies all failure modes into a single enum that
//! can be converted into an Axum HTTP response via its
//! [`IntoResponse`](axum::response::IntoResponse) implementation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use crossroads_core::session::SessionError;

/// Errors that can occur in the Observer API layer.
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    /// A session operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A request body or query failed validation.
    #[error("invalid request: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// A request was well-formed but cannot be honored.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ObserverError {
    /// HTTP status for this error.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Session(SessionError::AlreadyRunning | SessionError::NotRunning) => StatusCode::CONFLICT,
            Self::Session(SessionError::InvalidRequest(_)) | Self::Validation(_) | Self::InvalidRequest(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Session(SessionError::Spawn(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Session(SessionError::ConnectionFailed(_) | SessionError::ConnectionLost(_)) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

impl IntoResponse for ObserverError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
