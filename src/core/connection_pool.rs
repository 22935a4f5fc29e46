//! # Connection Pool Module
//!
//! Pooled outbound HTTP clients for upstream services. `reqwest::Client` keeps its
//! own per-host connection pool, so the gateway only needs one client per wire
//! protocol: HTTP/1.1 for most services and HTTP/2 with prior knowledge for services
//! whose descriptor asks for it.
//!
//! ## Rust Concepts Used
//!
//! - `reqwest::Client` is an `Arc` internally; cloning it shares the same pool
//! - Deadlines are applied per request, not per client, so one pool serves services
//!   with different timeouts

use std::time::Duration;

use crate::core::config::ProtocolVersion;
use crate::core::error::{GatewayError, GatewayResult};

/// Connect timeout for new upstream connections
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle pooled connections are closed after this long
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

const POOL_MAX_IDLE_PER_HOST: usize = 32;

/// One pooled client per upstream protocol
#[derive(Debug, Clone)]
pub struct UpstreamClients {
    http1: reqwest::Client,
    http2: reqwest::Client,
}

impl UpstreamClients {
    pub fn new() -> GatewayResult<Self> {
        let http1 = Self::base_builder()
            .http1_only()
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to build HTTP/1 client: {}", e)))?;

        let http2 = Self::base_builder()
            .http2_prior_knowledge()
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to build HTTP/2 client: {}", e)))?;

        Ok(Self { http1, http2 })
    }

    fn base_builder() -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .redirect(reqwest::redirect::Policy::none())
    }

    /// Client speaking the given protocol
    pub fn for_protocol(&self, protocol: ProtocolVersion) -> &reqwest::Client {
        match protocol {
            ProtocolVersion::Http1 => &self.http1,
            ProtocolVersion::Http2 => &self.http2,
        }
    }
}
