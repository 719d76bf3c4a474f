//! # Error Handling
//!
//! Custom error types and how they're converted to HTTP responses.
//!
//! ## Two layers:
//! - **CallError**: failures of the voice call lifecycle. Setup failures are
//!   terminal for the call; the taxonomy is intentionally coarse because a
//!   call is a best-effort realtime stream, not a durable transaction.
//! - **AppError**: what HTTP handlers return. Implements `ResponseError` so
//!   every failure renders as the same JSON envelope.
//!
//! Lower-level errors (`DeviceError`, `TransportError`, `PcmError`,
//! `StoreError`) live next to the code that raises them.

use crate::rooms::store::StoreError;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failures of a voice call.
///
/// ## Error Categories:
/// - **Acquisition**: microphone or speaker could not be opened (setup-time, fatal)
/// - **Connect**: remote streaming session could not be established (setup-time, fatal)
/// - **InvalidState**: operation not allowed in the current call state
/// - **CapacityExceeded**: the server is already running its maximum number of calls
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    Acquisition(String),
    Connect(String),
    InvalidState(String),
    CapacityExceeded(String),
}

impl CallError {
    /// Machine-readable code sent to WebSocket clients.
    pub fn code(&self) -> &'static str {
        match self {
            CallError::Acquisition(_) => "acquisition_error",
            CallError::Connect(_) => "connect_error",
            CallError::InvalidState(_) => "invalid_state",
            CallError::CapacityExceeded(_) => "capacity_exceeded",
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Acquisition(msg) => write!(f, "Could not acquire audio device: {}", msg),
            CallError::Connect(msg) => write!(f, "Could not connect to remote session: {}", msg),
            CallError::InvalidState(msg) => write!(f, "Invalid call state: {}", msg),
            CallError::CapacityExceeded(msg) => write!(f, "Call capacity exceeded: {}", msg),
        }
    }
}

impl std::error::Error for CallError {}

/// Custom error types for the HTTP layer.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: Temporarily out of capacity (503 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Message text cannot be empty",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
            AppError::Unavailable(msg) => ("unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidRoom(_) | StoreError::InvalidMessage(_) => {
                AppError::ValidationError(err.to_string())
            }
            StoreError::Unavailable(_) => AppError::Unavailable(err.to_string()),
        }
    }
}

impl From<CallError> for AppError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::CapacityExceeded(_) => AppError::Unavailable(err.to_string()),
            CallError::InvalidState(_) => AppError::BadRequest(err.to_string()),
            CallError::Acquisition(_) | CallError::Connect(_) => AppError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use actix_web::http::StatusCode;

    #[actix_web::test]
    async fn test_error_response_envelope() {
        let response = AppError::ValidationError("text is empty".to_string()).error_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "validation_error");
        assert_eq!(value["error"]["message"], "text is empty");
        assert!(value["error"]["timestamp"].is_string());
    }

    #[test]
    fn test_call_error_mapping() {
        let err: AppError = CallError::CapacityExceeded("10 calls".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err: AppError = StoreError::InvalidRoom(String::new()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        assert_eq!(CallError::Connect("timeout".to_string()).code(), "connect_error");
    }
}
