use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error types with appropriate HTTP status codes.
///
/// # Broker Errors
///
/// Broker failures are split by the phase in which they happen so that
/// callers (and logs) can tell them apart:
///
/// - `ConnectionFailed` - The broker could not be reached or refused the handshake
/// - `PublishFailed` - Connected, but the publish was not acknowledged
/// - `StreamSetup` - Connected, but the subscription for a stream could not be set up
/// - `Disconnected` - The connection was already gone when an operation was attempted
///
/// A client closing its event stream is not an error and has no variant here.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to connect to broker: {0}")]
    ConnectionFailed(String),

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Failed to set up message stream: {0}")]
    StreamSetup(String),

    #[error("Disconnected from broker: {0}")]
    Disconnected(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Operation timed out: {0}")]
    OperationTimeout(String),
}

impl AppError {
    /// Whether this error means the broker could not be used at all.
    pub fn is_broker_unavailable(&self) -> bool {
        matches!(
            self,
            AppError::ConnectionFailed(_)
                | AppError::PublishFailed(_)
                | AppError::StreamSetup(_)
                | AppError::Disconnected(_)
        )
    }
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Full details stay in the server log
        tracing::error!(error = %self, "Request failed");

        let (status, error_type, message) = match &self {
            AppError::ConnectionFailed(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "broker_connect_failure",
                "Message broker is temporarily unavailable. Please try again later.",
            ),
            AppError::PublishFailed(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "broker_publish_failure",
                "Failed to publish message to the broker. Please try again.",
            ),
            AppError::StreamSetup(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "stream_setup_failure",
                "Could not subscribe to the message stream. Please try again.",
            ),
            AppError::Disconnected(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "disconnected",
                "Connection to message broker was lost. Please try again.",
            ),
            AppError::OperationTimeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                "Operation timed out. Please try again.",
            ),
            AppError::SerializationError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "serialization_error",
                "Failed to encode message. Please contact support if the issue persists.",
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred. Please contact support if the issue persists.",
            ),
            AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "Service configuration error. Please contact support.",
            ),

            // Client errors carry user-facing messages
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.as_str()),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: message.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
