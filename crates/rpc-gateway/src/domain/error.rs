//! Gateway error types.
//!
//! [`CallError`] is the caller-visible outcome of a failed submission.
//! [`ApiError`] is its wire form on the HTTP surface, with a stable numeric
//! code and an HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stable error codes reported to HTTP callers.
pub mod codes {
    // Request errors
    pub const INVALID_REQUEST: i32 = 1000;
    pub const PAYLOAD_TOO_LARGE: i32 = 1001;

    // Correlation outcomes
    pub const TIMEOUT: i32 = 2000;
    pub const PUBLISH_FAILED: i32 = 2001;
    pub const BROKER_DISCONNECTED: i32 = 2002;
    pub const CANCELLED: i32 = 2003;

    // Server errors
    pub const BACKEND_ERROR: i32 = 5000;
    pub const INTERNAL_ERROR: i32 = 5001;
}

/// Outcome of a submission that did not produce a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// No reply arrived before the deadline.
    #[error("request timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },

    /// The broker did not accept the request.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// The broker connection dropped while the request was pending.
    #[error("broker disconnected")]
    BrokerDisconnected,

    /// The correlator shut down while the request was pending.
    #[error("request cancelled")]
    Cancelled,

    /// The pending-state backend failed.
    #[error("pending-state backend error: {0}")]
    Backend(String),
}

impl CallError {
    /// Stable code for this outcome.
    pub fn code(&self) -> i32 {
        match self {
            CallError::Timeout { .. } => codes::TIMEOUT,
            CallError::PublishFailed(_) => codes::PUBLISH_FAILED,
            CallError::BrokerDisconnected => codes::BROKER_DISCONNECTED,
            CallError::Cancelled => codes::CANCELLED,
            CallError::Backend(_) => codes::BACKEND_ERROR,
        }
    }

    /// Whether the failure came from infrastructure rather than a slow worker.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, CallError::Timeout { .. })
    }
}

/// Errors raised by a pending-state backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PendingError {
    /// An entry with this id is already pending.
    #[error("correlation id already pending")]
    Duplicate,

    /// The backing store rejected the operation.
    #[error("store error: {0}")]
    Store(String),

    /// Stored entry metadata could not be encoded or decoded.
    #[error("invalid entry metadata: {0}")]
    Metadata(String),
}

impl From<PendingError> for CallError {
    fn from(e: PendingError) -> Self {
        CallError::Backend(e.to_string())
    }
}

/// HTTP-facing error with a stable code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable error code (see [`codes`])
    pub code: i32,
    /// Error message
    pub message: String,
}

impl ApiError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Malformed request body
    pub fn invalid_request(details: impl Into<String>) -> Self {
        Self::new(
            codes::INVALID_REQUEST,
            format!("Invalid request: {}", details.into()),
        )
    }

    /// Internal error
    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(
            codes::INTERNAL_ERROR,
            format!("Internal error: {}", details.into()),
        )
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self.code {
            codes::INVALID_REQUEST => StatusCode::BAD_REQUEST,
            codes::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
            codes::TIMEOUT => StatusCode::GATEWAY_TIMEOUT,
            codes::PUBLISH_FAILED => StatusCode::BAD_GATEWAY,
            codes::BROKER_DISCONNECTED => StatusCode::SERVICE_UNAVAILABLE,
            // Closest standard status to nginx's 499
            codes::CANCELLED => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<CallError> for ApiError {
    fn from(e: CallError) -> Self {
        ApiError::new(e.code(), e.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::invalid_request(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(serde_json::json!({ "error": self }))).into_response()
    }
}

/// Result type for HTTP handlers
pub type ApiResult<T> = Result<T, ApiError>;

/// Gateway-level errors (startup and lifecycle)
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Server socket bind error
    #[error("server bind error: {0}")]
    Bind(String),

    /// Broker setup failed
    #[error("broker error: {0}")]
    Broker(#[from] shared_bus::BrokerError),

    /// Metric registration or encoding failed
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Shutdown in progress
    #[error("shutdown in progress")]
    ShuttingDown,
}
