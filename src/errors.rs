// ABOUTME: Centralized error handling and error types for the chat orchestration core
// ABOUTME: Defines the error taxonomy shared by transports, orchestrator, and storage
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! # Unified Error Handling System
//!
//! Every failure inside a turn is mapped to one of the `ErrorCode` variants
//! below before it reaches a transport. The HTTP status mapping and the
//! client-visible message sanitization live here so that route handlers and
//! the WebSocket binding produce identical error surfaces.

use std::fmt;
use std::io;

use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tracing::warn;

/// Standard error codes used throughout the application
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Authentication & Authorization
    /// Authentication is required but not provided
    AuthRequired,
    /// Authentication credentials are invalid
    AuthInvalid,
    /// Authentication token has expired
    AuthExpired,

    // Admission
    /// Rate limit has been exceeded
    RateLimitExceeded,
    /// Daily usage quota has been exceeded
    QuotaExceeded,
    /// Inbound content was flagged by the safety gate
    ContentFlagged,

    // Validation
    /// Input validation failed
    InvalidInput,
    /// Value is outside the acceptable range
    ValueOutOfRange,

    // Resources
    /// Requested resource was not found (or not owned by the caller)
    ResourceNotFound,
    /// Resource already exists (conflict)
    ResourceAlreadyExists,

    // Providers
    /// Provider adapter failed or timed out
    ProviderError,
    /// Provider is unavailable
    ProviderUnavailable,

    // Internal
    /// Internal server error
    InternalError,
    /// Database operation failed
    DatabaseError,
    /// Configuration error occurred
    ConfigError,
    /// Serialization/deserialization failed
    SerializationError,
    /// Service is unhealthy (startup dependencies unreachable)
    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::InvalidInput | Self::ValueOutOfRange | Self::ContentFlagged => 400,
            Self::AuthRequired => 401,
            Self::AuthInvalid | Self::AuthExpired => 403,
            Self::ResourceNotFound => 404,
            Self::ResourceAlreadyExists => 409,
            Self::RateLimitExceeded | Self::QuotaExceeded => 429,
            // Provider faults normally end as a fallback `done` on the turn
            // path; when one does reach HTTP it reads as service unavailable.
            Self::ProviderError | Self::ProviderUnavailable | Self::ServiceUnavailable => 503,
            Self::InternalError
            | Self::DatabaseError
            | Self::ConfigError
            | Self::SerializationError => 500,
        }
    }

    /// Get a user-friendly description of this error
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::AuthRequired => "Authentication is required to access this resource",
            Self::AuthInvalid => "The provided authentication credentials are invalid",
            Self::AuthExpired => "The authentication token has expired",
            Self::RateLimitExceeded => "Too Many Requests",
            Self::QuotaExceeded => "Daily usage quota exceeded",
            Self::ContentFlagged => "Content flagged",
            Self::InvalidInput => "The provided input is invalid",
            Self::ValueOutOfRange => "The provided value is outside the acceptable range",
            Self::ResourceNotFound => "The requested resource was not found",
            Self::ResourceAlreadyExists => "A resource with this identifier already exists",
            Self::ProviderError => "The AI provider encountered an error",
            Self::ProviderUnavailable => "The AI provider is currently unavailable",
            Self::InternalError => "An internal server error occurred",
            Self::DatabaseError => "Database operation failed",
            Self::ConfigError => "Configuration error encountered",
            Self::SerializationError => "Data serialization failed",
            Self::ServiceUnavailable => "Service is temporarily unavailable",
        }
    }

    /// Whether a client may reasonably retry the failed request
    #[must_use]
    pub const fn retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded
                | Self::QuotaExceeded
                | Self::ProviderError
                | Self::ProviderUnavailable
                | Self::InternalError
                | Self::DatabaseError
                | Self::ServiceUnavailable
        )
    }
}

/// Application error carried through orchestrator, storage, and transports
#[derive(Debug, Clone, ThisError)]
pub struct AppError {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Correlation id of the request that produced the error
    pub correlation_id: Option<String>,
    /// Seconds the client should wait before retrying (429 responses)
    pub retry_after_secs: Option<i64>,
    /// Safety screens that flagged the content (safety-block responses)
    pub flags: Vec<String>,
}

impl AppError {
    /// Create a new `AppError` with the given code and message
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            correlation_id: None,
            retry_after_secs: None,
            flags: Vec::new(),
        }
    }

    /// Attach a correlation id to the error
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Get the HTTP status code for this error
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// Get sanitized message safe for client exposure
    ///
    /// Validation, rate-limit, quota, and safety messages pass through
    /// unchanged (they tell the caller what to fix or how long to wait).
    /// Everything else collapses to the generic code description.
    #[must_use]
    pub fn sanitized_message(&self) -> String {
        match self.code {
            ErrorCode::InvalidInput
            | ErrorCode::ValueOutOfRange
            | ErrorCode::RateLimitExceeded
            | ErrorCode::QuotaExceeded
            | ErrorCode::ContentFlagged => self.message.clone(),
            _ => self.code.description().to_owned(),
        }
    }

    /// Full error details for internal logging. Never send to clients.
    #[must_use]
    pub fn internal_details(&self) -> String {
        format!("{:?}: {}", self.code, self.message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.description(), self.message)
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

/// HTTP error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Short error label (code description)
    pub error: String,
    /// Human-readable error message (sanitized for the client)
    pub message: String,
    /// Whether the client may retry
    pub retryable: bool,
    /// Safety screens that flagged the content (safety-block responses only)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    /// Optional correlation id for support tickets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// RFC3339 timestamp when the error occurred
    pub timestamp: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        warn!(
            correlation_id = error.correlation_id.as_deref().unwrap_or("-"),
            "API error: {}",
            error.internal_details()
        );

        Self {
            error: error.code.description().to_owned(),
            message: error.sanitized_message(),
            retryable: error.code.retryable(),
            flags: error.flags,
            correlation_id: error.correlation_id,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Convert `AppError` to an Axum `Response`
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        use axum::http::StatusCode;
        use axum::Json;

        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after = self.retry_after_secs;
        let body = ErrorResponse::from(self);

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

/// Convenience constructors for common errors
impl AppError {
    /// Authentication required
    #[must_use]
    pub fn auth_required() -> Self {
        Self::new(ErrorCode::AuthRequired, "Authentication required")
    }

    /// Invalid authentication
    #[must_use]
    pub fn auth_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthInvalid, message)
    }

    /// Rate limit exceeded, with a wait hint
    #[must_use]
    pub fn rate_limited(retry_after_secs: i64) -> Self {
        let mut error = Self::new(
            ErrorCode::RateLimitExceeded,
            format!("Too many requests; retry in {retry_after_secs}s"),
        );
        error.retry_after_secs = Some(retry_after_secs.max(1));
        error
    }

    /// Daily quota exceeded
    #[must_use]
    pub fn quota_exceeded() -> Self {
        Self::new(ErrorCode::QuotaExceeded, "Daily usage quota exceeded")
    }

    /// Resource not found
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        let resource_str = resource.into();
        Self::new(
            ErrorCode::ResourceNotFound,
            format!("{resource_str} not found"),
        )
    }

    /// Invalid input
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Safety gate rejection, carrying the triggered screens
    #[must_use]
    pub fn content_flagged(flags: &[String]) -> Self {
        let mut error = Self::new(
            ErrorCode::ContentFlagged,
            format!("Content flagged: {}", flags.join(", ")),
        );
        error.flags = flags.to_vec();
        error
    }

    /// Provider failure
    #[must_use]
    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProviderError, message)
    }

    /// Internal server error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Database error
    #[must_use]
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    /// Configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigError, message)
    }
}

impl From<io::Error> for AppError {
    fn from(error: io::Error) -> Self {
        Self::new(ErrorCode::InternalError, format!("IO error: {error}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(
            ErrorCode::SerializationError,
            format!("JSON error: {error}"),
        )
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        Self::database(format!("Database operation failed: {error}"))
    }
}

impl From<uuid::Error> for AppError {
    fn from(error: uuid::Error) -> Self {
        Self::new(ErrorCode::InvalidInput, format!("UUID error: {error}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        Self::new(
            ErrorCode::ProviderError,
            format!("HTTP client error: {error}"),
        )
    }
}
