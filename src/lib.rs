//! # Service Gateway Library
//!
//! A reverse-proxy gateway that fronts independently deployed backend services. It
//! routes each inbound request to a healthy instance of the right service while
//! enforcing per-service authentication and rate limits, and it isolates failing
//! instances with per-instance circuit breakers.
//!
//! ## Request path
//!
//! inbound request → route match → (rate limit, auth) → (cache check) →
//! instance selection (registry + breaker state) → forward → outcome reported to the
//! breaker and metrics → response
//!
//! The health monitor runs beside this path as a background task, probing every
//! instance and feeding the same breakers.
//!
//! ## Rust Module System Explained
//!
//! - `mod module_name;` declares a module; `use module_name::item;` imports from it
//! - Items are private by default; `pub` exposes them outside the module
//! - `pub use` re-exports items so users can import them from the crate root

/// Error types, configuration, shared request/response types, circuit breaker and
/// upstream HTTP clients
pub mod core;

/// HTTP server, request dispatcher, post-dispatch hooks and component wiring
pub mod gateway;

/// Per-service rate limiting
pub mod middleware;

/// Authentication providers (JWT bearer tokens)
pub mod auth;

/// Instance selection strategies
pub mod load_balancing;

/// Service registry: configured services and their runtime instances
pub mod discovery;

/// Prefix route table
pub mod routing;

/// Health monitoring, structured logging and metrics export
pub mod observability;

/// Short-TTL response cache for idempotent GET routes
pub mod caching;

/// Main error type used throughout the gateway
pub use core::error::{GatewayError, GatewayResult};

/// Main configuration structure for the gateway
pub use core::config::GatewayConfig;

pub use core::types::{GatewayResponse, IncomingRequest};

pub use gateway::{GatewayRuntime, RequestDispatcher};
