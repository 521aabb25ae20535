// Error handling module
// Defines error types and HTTP response conversion for the control API

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the re-authentication engine and its control surface
#[derive(Error, Debug)]
pub enum ReauthError {
    /// An endpoint string could not be parsed as a URL
    #[error("Malformed endpoint: {input} - {reason}")]
    MalformedEndpoint { input: String, reason: String },

    /// The token extraction expression is invalid
    #[error("Invalid token pattern: {0}")]
    PatternCompile(String),

    /// The header name cannot be used to build a header line
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(String),

    /// The reauthentication interval is out of range
    #[error("Invalid reauthentication interval: {0}")]
    InvalidInterval(String),

    /// A raw HTTP message could not be split into head and body
    #[error("Malformed HTTP message: {0}")]
    MalformedMessage(String),

    /// No scope rule at the given row
    #[error("Scope rule {0} does not exist")]
    ScopeRuleNotFound(usize),

    /// The outbound refresh request failed
    #[error("Refresh transport failed: {0}")]
    RefreshTransport(String),

    /// The engine was constructed outside of a tokio runtime
    #[error("No async runtime available: {0}")]
    Runtime(String),

    /// Control API key check failed
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ReauthError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ReauthError::MalformedEndpoint { .. } => (StatusCode::BAD_REQUEST, "malformed_endpoint"),
            ReauthError::PatternCompile(_) => (StatusCode::BAD_REQUEST, "pattern_compile_error"),
            ReauthError::InvalidHeaderName(_) => (StatusCode::BAD_REQUEST, "invalid_header_name"),
            ReauthError::InvalidInterval(_) => (StatusCode::BAD_REQUEST, "invalid_interval"),
            ReauthError::MalformedMessage(_) => (StatusCode::BAD_REQUEST, "malformed_message"),
            ReauthError::ScopeRuleNotFound(_) => (StatusCode::NOT_FOUND, "scope_rule_not_found"),
            ReauthError::RefreshTransport(_) => (StatusCode::BAD_GATEWAY, "refresh_transport_error"),
            ReauthError::Runtime(_) => (StatusCode::INTERNAL_SERVER_ERROR, "runtime_error"),
            ReauthError::AuthError(_) => (StatusCode::UNAUTHORIZED, "auth_error"),
            ReauthError::ValidationError(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ReauthError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let message = match &self {
            ReauthError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, ReauthError>;
