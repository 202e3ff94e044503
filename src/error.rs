//! Error types for the zpwoot gateway
//!
//! This module defines all error types used throughout the gateway.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.
//!
//! The variants follow a fixed taxonomy: user-facing kinds (`NotFound`,
//! `AlreadyExists`, `InvalidArgument`, `FailedPrecondition`) map to 4xx HTTP
//! statuses at the boundary, infrastructure kinds (`Unavailable`, `Internal`,
//! `DeadlineExceeded`) map to 5xx.

use thiserror::Error;

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Requested resource does not exist (session, subscription, mapping, etc.)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists (duplicate session name, duplicate subscription)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Request validation failures (empty recipient, unknown event type, etc.)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation requires a state the session is not in (e.g. not connected)
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Authentication failures against an upstream service (Chatwoot 401)
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Authorization failures against an upstream service (Chatwoot 403)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Rate limits and full queues (Chatwoot 429, webhook queue saturated)
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Network failures and upstream 5xx responses
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// An outbound call exceeded its deadline
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Unexpected internal failures (adapter errors, corrupt state)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration-related errors (invalid config, missing required fields)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// SQLite storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// An internal channel closed unexpectedly
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl GatewayError {
    /// Maps upstream HTTP status codes to the error taxonomy.
    ///
    /// Used by the Chatwoot client and webhook delivery to classify responses
    /// without string matching.
    pub fn from_status(status: u16, context: &str) -> Self {
        match status {
            401 => GatewayError::Unauthenticated(context.to_string()),
            403 => GatewayError::PermissionDenied(context.to_string()),
            404 => GatewayError::NotFound(context.to_string()),
            409 => GatewayError::AlreadyExists(context.to_string()),
            429 => GatewayError::ResourceExhausted(context.to_string()),
            500..=599 => GatewayError::Unavailable(format!("{} (status {})", context, status)),
            _ => GatewayError::Internal(format!("{} (status {})", context, status)),
        }
    }

    /// Returns the HTTP status code this error maps to at the API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::NotFound(_) => 404,
            GatewayError::AlreadyExists(_) => 409,
            GatewayError::InvalidArgument(_) => 400,
            GatewayError::FailedPrecondition(_) => 412,
            GatewayError::Unauthenticated(_) => 401,
            GatewayError::PermissionDenied(_) => 403,
            GatewayError::ResourceExhausted(_) => 429,
            GatewayError::Unavailable(_) => 503,
            GatewayError::DeadlineExceeded(_) => 504,
            GatewayError::Config(_) => 500,
            GatewayError::Internal(_)
            | GatewayError::Io(_)
            | GatewayError::Json(_)
            | GatewayError::Http(_)
            | GatewayError::Storage(_)
            | GatewayError::ChannelClosed(_) => 500,
        }
    }

    /// Stable machine-readable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => "not_found",
            GatewayError::AlreadyExists(_) => "already_exists",
            GatewayError::InvalidArgument(_) => "invalid_argument",
            GatewayError::FailedPrecondition(_) => "failed_precondition",
            GatewayError::Unauthenticated(_) => "unauthenticated",
            GatewayError::PermissionDenied(_) => "permission_denied",
            GatewayError::ResourceExhausted(_) => "resource_exhausted",
            GatewayError::Unavailable(_) => "unavailable",
            GatewayError::DeadlineExceeded(_) => "deadline_exceeded",
            GatewayError::Config(_) => "config",
            _ => "internal",
        }
    }
}

/// A specialized `Result` type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::NotFound("session abc".to_string());
        assert_eq!(err.to_string(), "Not found: session abc");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GatewayError = io_err.into();
        assert!(matches!(err, GatewayError::Io(_)));
    }

    #[test]
    fn test_from_status_classification() {
        assert!(matches!(
            GatewayError::from_status(401, "chatwoot"),
            GatewayError::Unauthenticated(_)
        ));
        assert!(matches!(
            GatewayError::from_status(403, "chatwoot"),
            GatewayError::PermissionDenied(_)
        ));
        assert!(matches!(
            GatewayError::from_status(404, "chatwoot"),
            GatewayError::NotFound(_)
        ));
        assert!(matches!(
            GatewayError::from_status(429, "chatwoot"),
            GatewayError::ResourceExhausted(_)
        ));
        assert!(matches!(
            GatewayError::from_status(503, "chatwoot"),
            GatewayError::Unavailable(_)
        ));
        assert!(matches!(
            GatewayError::from_status(418, "chatwoot"),
            GatewayError::Internal(_)
        ));
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(GatewayError::NotFound("x".into()).http_status(), 404);
        assert_eq!(GatewayError::AlreadyExists("x".into()).http_status(), 409);
        assert_eq!(GatewayError::InvalidArgument("x".into()).http_status(), 400);
        assert_eq!(
            GatewayError::FailedPrecondition("x".into()).http_status(),
            412
        );
        assert_eq!(GatewayError::Unauthenticated("x".into()).http_status(), 401);
        assert_eq!(GatewayError::PermissionDenied("x".into()).http_status(), 403);
        assert_eq!(
            GatewayError::ResourceExhausted("x".into()).http_status(),
            429
        );
        assert_eq!(GatewayError::Unavailable("x".into()).http_status(), 503);
        assert_eq!(GatewayError::DeadlineExceeded("x".into()).http_status(), 504);
        assert_eq!(GatewayError::Internal("x".into()).http_status(), 500);
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(GatewayError::NotFound("x".into()).code(), "not_found");
        assert_eq!(
            GatewayError::FailedPrecondition("x".into()).code(),
            "failed_precondition"
        );
        assert_eq!(GatewayError::Internal("x".into()).code(), "internal");
        assert_eq!(GatewayError::ChannelClosed("x".into()).code(), "internal");
    }

    #[test]
    fn test_result_type() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(returns_result().unwrap(), 42);
    }
}
