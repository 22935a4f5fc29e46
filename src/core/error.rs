//! # Error Handling Module
//!
//! This module defines every error the gateway can surface, using the `thiserror` crate,
//! together with the HTTP status each one maps to.
//!
//! ## Error Taxonomy
//!
//! | Variant                 | Status | Downstream contacted? |
//! |-------------------------|--------|-----------------------|
//! | `RouteNotFound`         | 404    | no                    |
//! | `Unauthorized`          | 401    | no                    |
//! | `RateLimited`           | 429    | no                    |
//! | `NoEligibleInstance`    | 503    | no                    |
//! | `DownstreamTimeout`     | 504    | yes (deadline hit)    |
//! | `DownstreamUnavailable` | 503    | yes (connect/reset)   |
//!
//! ## Rust Error Handling Concepts
//!
//! - `Result<T, E>` replaces exceptions; `?` propagates errors up the call stack
//! - Each enum variant is one failure category, and `match` forces every caller to
//!   consider all of them
//! - `thiserror` derives `Display` and `std::error::Error` from the `#[error(...)]` attributes
//! - `From` implementations let `?` convert library errors (I/O, YAML, JSON) automatically

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::core::types::CORRELATION_ID_HEADER;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors produced by the gateway
///
/// The `#[error("...")]` attribute from `thiserror` implements `Display`
/// with the given message.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// No route prefix matched the request path
    #[error("No route configured for path: {path}")]
    RouteNotFound { path: String, prefixes: Vec<String> },

    /// The auth collaborator rejected the request
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// Per-service rate limit exhausted
    #[error("Rate limit exceeded for service: {service}")]
    RateLimited { service: String, retry_after_secs: u64 },

    /// Every instance is unhealthy or behind an open breaker
    #[error("No eligible instance for service: {service}")]
    NoEligibleInstance { service: String },

    /// The downstream call exceeded its deadline
    #[error("Service {service} timed out after {timeout_ms}ms")]
    DownstreamTimeout { service: String, timeout_ms: u64 },

    /// Connection refused, reset, or otherwise unreachable
    #[error("Service unavailable: {service} - {reason}")]
    DownstreamUnavailable { service: String, reason: String },

    /// The inbound request could not be read (body too large, broken stream)
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, socket binding, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an unauthorized error with a custom reason
    pub fn unauthorized<S: Into<String>>(reason: S) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a downstream-unavailable error
    pub fn unavailable<S: Into<String>, R: Into<String>>(service: S, reason: R) -> Self {
        Self::DownstreamUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Get the HTTP status code returned to clients for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NoEligibleInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::DownstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::DownstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the client may retry the same request later
    ///
    /// The gateway never retries `NoEligibleInstance` itself; the hint tells the
    /// caller to come back once the breaker window has passed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::NoEligibleInstance { .. }
                | Self::DownstreamTimeout { .. }
                | Self::DownstreamUnavailable { .. }
        )
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::RouteNotFound { .. } => "route_not_found",
            Self::Unauthorized { .. } => "unauthorized",
            Self::RateLimited { .. } => "rate_limited",
            Self::NoEligibleInstance { .. } => "no_eligible_instance",
            Self::DownstreamTimeout { .. } => "downstream_timeout",
            Self::DownstreamUnavailable { .. } => "downstream_unavailable",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }

    /// Build the JSON error response carrying the request's correlation id
    pub fn to_response(&self, correlation_id: &str) -> Response {
        let status = self.status_code();

        let mut body = json!({
            "error": {
                "code": status.as_u16(),
                "type": self.error_type(),
                "message": self.to_string(),
                "retryable": self.is_retryable(),
            },
            "correlation_id": correlation_id,
        });

        if let Self::RouteNotFound { prefixes, .. } = self {
            body["available_prefixes"] = json!(prefixes);
        }

        let mut response = (status, Json(body)).into_response();

        if let Ok(value) = HeaderValue::from_str(correlation_id) {
            response.headers_mut().insert(CORRELATION_ID_HEADER, value);
        }
        if let Self::RateLimited { retry_after_secs, .. } = self {
            response
                .headers_mut()
                .insert("retry-after", HeaderValue::from(*retry_after_secs));
        }

        response
    }
}

/// Implement conversion from std::io::Error
impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_json::Error
impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_yaml::Error
impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Errors outside a request (startup, admin endpoints) have no correlation id of
/// their own, so one is generated for the response.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.to_response(&uuid::Uuid::new_v4().to_string())
    }
}
