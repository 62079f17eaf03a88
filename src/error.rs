//! Error types for the video ingest server.
//!
//! This module defines a unified error handling system using `thiserror`.
//! All errors are converted to appropriate HTTP responses automatically.
//!
//! # Error Categories
//!
//! - **Client errors (4xx)**: Invalid input, missing sessions, ownership
//!   violations, terminal-state conflicts
//! - **Server errors (5xx)**: Transient storage/queue/index failures,
//!   invariant violations, I/O errors
//!
//! Queue consumers route on the error kind: only `Transient` goes back to a
//! retry queue; `Fatal` (and everything else a worker cannot interpret) is
//! dead-lettered.
//!
//! # Example
//!
//! ```rust,ignore
//! use crate::error::{AppError, Result};
//!
//! fn validate_chunk_index(index: u64, total: u64) -> Result<()> {
//!     if index >= total {
//!         return Err(AppError::invalid_input("chunk index out of range"));
//!     }
//!     Ok(())
//! }
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
///
/// This enum represents all possible errors that can occur in the application.
/// Each variant is mapped to an appropriate HTTP status code.
#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // Client Errors (4xx)
    // -------------------------------------------------------------------------
    /// Request violates a declared constraint
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Referenced session, video or blob absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing caller identity
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller does not own the referenced resource
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Session in a terminal state for the attempted operation, or the
    /// target of a rename already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Request payload exceeds the declared limit
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    // -------------------------------------------------------------------------
    // Server Errors (5xx)
    // -------------------------------------------------------------------------
    /// Temporary failure of storage, queue, index or database; queue
    /// consumers retry these up to the bounded depth
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Invariant violation detected by a worker; never retried
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    // -------------------------------------------------------------------------
    // Convenience constructors
    // -------------------------------------------------------------------------

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an unauthorized error
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a payload too large error
    pub fn payload_too_large<S: Into<String>>(msg: S) -> Self {
        Self::PayloadTooLarge(msg.into())
    }

    /// Create a rate limit exceeded error
    pub fn rate_limit_exceeded<S: Into<String>>(msg: S) -> Self {
        Self::RateLimitExceeded(msg.into())
    }

    /// Create a transient error
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a fatal error
    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        Self::Fatal(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 4xx Client Errors
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,

            // 5xx Server Errors
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check whether a queue consumer may retry after this error.
    ///
    /// I/O and database failures count as transient: the stores they wrap
    /// report temporary unavailability through them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Io(_) | Self::Database(_) | Self::Internal(_)
        )
    }

    /// Check if this error must be dead-lettered without retry
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Error response body sent to clients
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Add status code to the response
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status.as_u16());
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Log server errors
        if self.is_server_error() {
            tracing::error!(error = %self, "Server error occurred");
        } else {
            tracing::debug!(error = %self, "Client error occurred");
        }

        // Create error response
        let error_type = match &self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::RateLimitExceeded(_) => "rate_limit_exceeded",
            Self::Transient(_) => "transient",
            Self::Fatal(_) => "fatal",
            Self::Internal(_) => "internal_error",
            Self::Io(_) => "io_error",
            Self::Database(_) => "database_error",
            Self::Config(_) => "config_error",
        };

        // For server errors, don't expose internal details to clients
        let message = if self.is_server_error() {
            "A server error occurred. Please try again later.".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorResponse::new(error_type, message).with_status(status);

        (status, Json(body)).into_response()
    }
}

// -------------------------------------------------------------------------
// Error conversions from external crates
// -------------------------------------------------------------------------

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        Self::InvalidInput(format!("Invalid UUID: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("Serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AppError::invalid_input("test").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::not_found("test").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::conflict("test").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::transient("test").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::fatal("test").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_categories() {
        assert!(AppError::invalid_input("test").is_client_error());
        assert!(!AppError::invalid_input("test").is_server_error());
        assert!(AppError::transient("test").is_server_error());
        assert!(AppError::forbidden("test").is_client_error());
    }

    #[test]
    fn test_retry_routing() {
        assert!(AppError::transient("queue down").is_retryable());
        assert!(!AppError::transient("queue down").is_fatal());
        assert!(AppError::fatal("invariant broken").is_fatal());
        assert!(!AppError::fatal("invariant broken").is_retryable());
        assert!(!AppError::invalid_input("bad index").is_retryable());
        assert!(!AppError::not_found("gone").is_retryable());
    }
}
