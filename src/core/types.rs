//! # Core Types Module
//!
//! Request, response and authentication types shared by the dispatcher, the auth
//! collaborator and the HTTP server.
//!
//! ## Rust Ownership Concepts in This Module
//!
//! - `Bytes` is a reference-counted buffer, so cloning a request body for a retry
//!   does not copy the payload
//! - `HeaderMap` owns its header names and values; the request owns its headers

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;
use uuid::Uuid;

/// Header carrying the request correlation identifier
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Header naming the authenticated user, set on proxied requests
pub const USER_ID_HEADER: &str = "x-user-id";

/// Header listing the authenticated user's roles (comma separated)
pub const USER_ROLES_HEADER: &str = "x-user-roles";

/// Header naming the instance that produced a response
pub const SERVED_BY_HEADER: &str = "x-served-by";

/// Header reporting response cache status (`HIT` / `MISS`)
pub const CACHE_STATUS_HEADER: &str = "x-cache";

/// Represents an inbound request once its body has been buffered
///
/// This is the unified request type the dispatcher works with; the axum handler
/// converts into it and the dispatcher never sees framework types beyond `http`.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Correlation identifier, taken from the client or generated
    pub correlation_id: String,

    /// HTTP method (GET, POST, etc.)
    pub method: Method,

    /// Request URI including path and query parameters
    pub uri: Uri,

    /// Request headers
    pub headers: HeaderMap,

    /// Request body
    pub body: Bytes,

    /// Client's remote address, when the listener exposes it
    pub remote_addr: Option<SocketAddr>,

    /// Timestamp when the request was received
    pub received_at: Instant,
}

impl IncomingRequest {
    /// Create a new request, adopting the client's correlation id when present
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let correlation_id = headers
            .get(CORRELATION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            correlation_id,
            method,
            uri,
            headers,
            body,
            remote_addr,
            received_at: Instant::now(),
        }
    }

    /// Get the request path without query parameters
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Get the raw query string
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    /// Client IP used for rate-limit keys and `X-Forwarded-For`
    pub fn client_ip(&self) -> String {
        self.remote_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Response produced by the dispatcher (proxied, cached or synthesized)
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// HTTP status code
    pub status: StatusCode,

    /// Response headers
    pub headers: HeaderMap,

    /// Response body
    pub body: Bytes,
}

impl GatewayResponse {
    /// Create a new gateway response
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Set a header, ignoring values that are not valid header text
    pub fn set_header(&mut self, name: &'static str, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Authentication context produced by the auth collaborator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthContext {
    /// Unique user identifier
    pub user_id: String,

    /// User roles, forwarded downstream
    pub roles: Vec<String>,
}

impl AuthContext {
    /// Check if user has a specific role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_is_adopted_from_client() {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_ID_HEADER, "abc-123".parse().unwrap());

        let request = IncomingRequest::new(
            Method::GET,
            "/api/orders?page=2".parse().unwrap(),
            headers,
            Bytes::new(),
            None,
        );

        assert_eq!(request.correlation_id, "abc-123");
        assert_eq!(request.path(), "/api/orders");
        assert_eq!(request.query(), Some("page=2"));
        assert_eq!(request.client_ip(), "unknown");
    }

    #[test]
    fn test_correlation_id_is_generated_when_absent() {
        let request = IncomingRequest::new(
            Method::GET,
            "/".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            Some("10.0.0.7:5555".parse().unwrap()),
        );

        assert!(Uuid::parse_str(&request.correlation_id).is_ok());
        assert_eq!(request.client_ip(), "10.0.0.7");
    }
}
