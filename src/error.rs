use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors surfaced by the HTTP surface (health, metrics).
///
/// WebSocket-level failures do not go through this type — they are
/// reported as `ERROR` protocol frames via [`crate::error::ErrorKind`]
/// so a malformed message never needs an HTTP status code.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".into())
            }
            AppError::SerdeJson(e) => {
                tracing::error!("serialization error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "serialization error".into())
            }
        };

        let body = json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
            }
        });

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Error kinds surfaced to WebSocket clients and used for session-level
/// bookkeeping, per the table in §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authentication,
    RateLimited,
    DuplicateSigner,
    IneligibleSigner,
    InvalidSignature,
    NotReady,
    AlreadyInjected,
    Expired,
    TransactionWindowExceeded,
    ExecutionFailed,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::DuplicateSigner => "duplicate_signer",
            ErrorKind::IneligibleSigner => "ineligible_signer",
            ErrorKind::InvalidSignature => "invalid_signature",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::AlreadyInjected => "already_injected",
            ErrorKind::Expired => "expired",
            ErrorKind::TransactionWindowExceeded => "transaction_window_exceeded",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process exit codes for the host process (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Validation = 1,
    Network = 2,
    Authentication = 3,
    Timeout = 4,
    UserCancelled = 5,
    ThresholdNotMet = 6,
    TransactionRejected = 7,
    SessionError = 8,
    Internal = 9,
}
