//! Session Controller error types.
//!
//! Every variant carries a stable machine-readable code and maps to an HTTP
//! status via the `IntoResponse` impl. Internal details are logged
//! server-side and never returned to clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Session Controller error type.
///
/// Maps to HTTP status codes:
/// - `Validation`, `NotEnoughBalance`, `InvalidTransition`: 400
/// - `*NotFound`: 404
/// - `TransactionConflict`: 409
/// - `UserAlreadyExist`, `ChannelRestricted`, `UserOnACall`: 423 (Locked)
/// - `UserLowOnBalance`: 424 (Failed Dependency)
/// - `FailedToStartRecording`, `Store`, `External`, `Internal`: 500
/// - `Unavailable`: 503
#[derive(Debug, Error)]
pub enum ScError {
    /// Missing or malformed input, rejected before touching any aggregate.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Temp host not found: {0}")]
    TempHostNotFound(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Candidate is already queued for this host and session type.
    #[error("User already in waitlist: {0}")]
    UserAlreadyExist(String),

    /// Channel is occupied, offline, or of a different type.
    #[error("Channel restricted: {0}")]
    ChannelRestricted(String),

    /// Candidate is already occupying another channel.
    #[error("User is on a call: {0}")]
    UserOnACall(String),

    /// Balance below the minimum required to join an online channel.
    #[error("User low on balance: required {required:.2}, available {available:.2}")]
    UserLowOnBalance { required: f64, available: f64 },

    /// Balance would not cover the minimum session length on accept.
    #[error("Not enough balance for a {min_seconds}s session")]
    NotEnoughBalance { min_seconds: i64 },

    /// Requested edge is not present in the temp host transition table.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Recording acquire/start failed; the in-flight transition was aborted.
    #[error("Failed to start recording: {0}")]
    FailedToStartRecording(String),

    /// Versioned commit lost to a concurrent writer after all retries.
    #[error("Transaction conflict on {0}")]
    TransactionConflict(String),

    /// Aggregate store failure. No partial writes are visible.
    #[error("Store error: {0}")]
    Store(String),

    /// Non-recording external collaborator failure.
    #[error("External service error: {0}")]
    External(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Controller is draining or a host actor mailbox has closed.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl ScError {
    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ScError::Validation(_)
            | ScError::NotEnoughBalance { .. }
            | ScError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            ScError::UserNotFound(_)
            | ScError::HostNotFound(_)
            | ScError::ChannelNotFound(_)
            | ScError::TempHostNotFound(_)
            | ScError::OrderNotFound(_) => StatusCode::NOT_FOUND,
            ScError::TransactionConflict(_) => StatusCode::CONFLICT,
            ScError::UserAlreadyExist(_)
            | ScError::ChannelRestricted(_)
            | ScError::UserOnACall(_) => StatusCode::LOCKED,
            ScError::UserLowOnBalance { .. } => StatusCode::FAILED_DEPENDENCY,
            ScError::FailedToStartRecording(_)
            | ScError::Store(_)
            | ScError::External(_)
            | ScError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ScError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Returns the stable error code string for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            ScError::Validation(_) => "VALIDATION_ERROR",
            ScError::UserNotFound(_) => "USER_NOT_FOUND",
            ScError::HostNotFound(_) => "HOST_NOT_FOUND",
            ScError::ChannelNotFound(_) => "CHANNEL_NOT_FOUND",
            ScError::TempHostNotFound(_) => "TEMP_HOST_NOT_FOUND",
            ScError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            ScError::UserAlreadyExist(_) => "USER_ALREADY_EXIST",
            ScError::ChannelRestricted(_) => "CHANNEL_RESTRICTED",
            ScError::UserOnACall(_) => "USER_ON_A_CALL",
            ScError::UserLowOnBalance { .. } => "USER_LOW_ON_BALANCE",
            ScError::NotEnoughBalance { .. } => "NOT_ENOUGH_BALANCE",
            ScError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ScError::FailedToStartRecording(_) => "FAILED_TO_START_RECORDING",
            ScError::TransactionConflict(_) => "TRANSACTION_CONFLICT",
            ScError::Store(_) => "STORE_ERROR",
            ScError::External(_) => "EXTERNAL_SERVICE_ERROR",
            ScError::Internal(_) => "INTERNAL_ERROR",
            ScError::Unavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    /// Returns a bounded label for metrics.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            ScError::Validation(_) => "validation",
            ScError::UserNotFound(_)
            | ScError::HostNotFound(_)
            | ScError::ChannelNotFound(_)
            | ScError::TempHostNotFound(_)
            | ScError::OrderNotFound(_) => "not_found",
            ScError::UserAlreadyExist(_) | ScError::ChannelRestricted(_) | ScError::UserOnACall(_) => {
                "conflict"
            }
            ScError::UserLowOnBalance { .. } | ScError::NotEnoughBalance { .. } => {
                "insufficient_funds"
            }
            ScError::InvalidTransition { .. } => "transition",
            ScError::FailedToStartRecording(_) | ScError::External(_) => "external",
            ScError::TransactionConflict(_) | ScError::Store(_) => "transaction",
            ScError::Internal(_) => "internal",
            ScError::Unavailable(_) => "unavailable",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            ScError::Store(_) | ScError::Internal(_) | ScError::External(_) => {
                "An internal error occurred".to_string()
            }
            ScError::FailedToStartRecording(_) => "Failed to start recording".to_string(),
            ScError::Unavailable(_) => "Service temporarily unavailable".to_string(),
            ScError::TransactionConflict(_) => {
                "The request conflicted with a concurrent update, please retry".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for ScError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            ScError::Store(err) | ScError::Internal(err) | ScError::External(err) => {
                tracing::error!(target: "sc.errors", error = %err, code = self.error_code(), "Request failed");
            }
            ScError::FailedToStartRecording(err) => {
                tracing::warn!(target: "sc.errors", error = %err, "Recording start failed");
            }
            _ => {}
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code(),
                message: self.client_message(),
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<serde_json::Error> for ScError {
    fn from(err: serde_json::Error) -> Self {
        ScError::Internal(format!("serialization failed: {err}"))
    }
}

impl From<redis::RedisError> for ScError {
    fn from(err: redis::RedisError) -> Self {
        ScError::Store(err.to_string())
    }
}

impl From<reqwest::Error> for ScError {
    fn from(err: reqwest::Error) -> Self {
        ScError::External(err.to_string())
    }
}
