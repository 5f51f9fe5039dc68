//! # Error Handling
//!
//! Two error families live here:
//!
//! - [`VoiceError`]: failures inside a live call. Every variant is recovered
//!   locally by the session (fallback reply, skipped audio, degraded
//!   transcription) or reported to the client as an `error` event. None of
//!   them closes the socket by itself.
//! - [`AppError`]: failures of the diagnostic HTTP endpoints, rendered as JSON
//!   responses through actix's `ResponseError`.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors raised while running a voice session.
///
/// ## Error Categories:
/// - **NotFound**: the agent identifier in `start` does not resolve
/// - **Configuration**: a credential or collaborator is missing at session start
/// - **Upstream**: the recognizer, language model or synthesis call failed
/// - **Protocol**: the client sent a malformed message
/// - **Persistence**: a transcript write failed
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceError {
    NotFound(String),
    Configuration(String),
    Upstream { service: &'static str, message: String },
    Protocol(String),
    Persistence(String),
}

impl VoiceError {
    /// Wrap any displayable failure of an upstream service.
    pub fn upstream(service: &'static str, err: impl fmt::Display) -> Self {
        VoiceError::Upstream {
            service,
            message: err.to_string(),
        }
    }

    /// Short machine-readable kind, used in logs and `log` event metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            VoiceError::NotFound(_) => "not_found",
            VoiceError::Configuration(_) => "configuration_error",
            VoiceError::Upstream { .. } => "upstream_service_error",
            VoiceError::Protocol(_) => "protocol_error",
            VoiceError::Persistence(_) => "persistence_error",
        }
    }
}

impl fmt::Display for VoiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceError::NotFound(msg) => write!(f, "Not found: {}", msg),
            VoiceError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            VoiceError::Upstream { service, message } => {
                write!(f, "Upstream {} error: {}", service, message)
            }
            VoiceError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            VoiceError::Persistence(msg) => write!(f, "Persistence error: {}", msg),
        }
    }
}

impl std::error::Error for VoiceError {}

/// Malformed JSON from the client is a protocol error.
impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Protocol(format!("invalid JSON: {}", err))
    }
}

/// Undecodable base64 payloads are a protocol error.
impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Protocol(format!("invalid base64 payload: {}", err))
    }
}

/// Errors returned by the diagnostic HTTP endpoints.
#[derive(Debug)]
pub enum AppError {
    /// Server-side problems (500)
    Internal(String),

    /// Requested resource was not found (404)
    NotFound(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Session abc does not exist",
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
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
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

impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::NotFound(msg) => AppError::NotFound(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
