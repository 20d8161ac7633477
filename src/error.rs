//! # Error Handling
//!
//! Two error families live here:
//!
//! - [`AppError`]: errors surfaced to HTTP clients (config endpoints, socket
//!   upgrade). Implements `ResponseError` so handlers can just return it.
//! - [`CallError`]: errors on the call path. These follow the propagation
//!   policy of the bridge: a `Session` error terminates the call, everything
//!   else is isolated to the event that produced it and logged.
//!
//! ## Call-path propagation policy:
//! - **Session**: the AI-backend session failed to initialize or died.
//!   Fatal to the call; the bridge transitions straight to `Closing`.
//! - **Delivery**: the socket sink closed mid-playback. Expected during
//!   hangup, dropped silently.
//! - **Dispatch**: the turn-result webhook was unreachable or rejected the
//!   payload. Logged, never retried, never reaches the audio path.
//! - **InvalidBuffer**: a turn carried a malformed audio buffer (shorter
//!   than its header). Fatal to that one turn's playback only.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned from HTTP request handlers.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500 (Internal Server Error)
/// - BadRequest/ValidationError → 400 (Bad Request)
/// - TooManyCalls → 503 (Service Unavailable)
#[derive(Debug)]
pub enum AppError {
    /// Server-side problems (lock poisoning, serialization failures, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// The concurrent-call limit has been reached
    TooManyCalls(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::TooManyCalls(msg) => write!(f, "Too many calls: {}", msg),
        }
    }
}

/// Converts an `AppError` into a JSON HTTP response.
///
/// All errors share one response shape:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Frame size cannot be 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::TooManyCalls(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "too_many_calls",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
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

/// Errors produced on the call path (session, playback, dispatch).
///
/// Only `Session` is fatal to a call. The other variants are per-event and
/// never propagate past the component that logged them.
#[derive(Debug)]
pub enum CallError {
    /// AI-backend session failed to initialize or dropped mid-call
    Session(String),

    /// Frame delivery failed because the socket sink closed
    Delivery(String),

    /// Turn-result webhook unreachable or rejected the payload
    Dispatch(String),

    /// Audio buffer shorter than the header it is supposed to carry
    InvalidBuffer { len: usize, header_len: usize },
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Session(msg) => write!(f, "Session error: {}", msg),
            CallError::Delivery(msg) => write!(f, "Delivery error: {}", msg),
            CallError::Dispatch(msg) => write!(f, "Dispatch error: {}", msg),
            CallError::InvalidBuffer { len, header_len } => write!(
                f,
                "Invalid audio buffer: {} bytes is shorter than the {}-byte header",
                len, header_len
            ),
        }
    }
}

impl std::error::Error for CallError {}

/// Shorthand for `Result<T, AppError>` in handler signatures.
pub type AppResult<T> = Result<T, AppError>;
