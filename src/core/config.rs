//! # Configuration Module
//!
//! Strongly-typed gateway configuration, loaded once at startup from YAML.
//!
//! ## Key Features
//! - YAML parsing with serde, human-readable durations via `humantime-serde`
//! - Environment variable overrides for deployment-specific values
//! - Validation with detailed error messages before anything is built
//!
//! A minimal document:
//!
//! ```yaml
//! services:
//!   - name: orders
//!     base_address: http://orders-0:3001
//!     replicas: [http://orders-1:3001]
//!     path_prefix: /api/orders
//!     timeout: 5s
//!     retries: 2
//! routes:
//!   - path_prefix: /api/orders
//!     service: orders
//! ```

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::core::circuit_breaker::{CircuitBreakerConfig, Outcome};
use crate::core::error::{GatewayError, GatewayResult};

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Background health probing
    #[serde(default)]
    pub health: HealthMonitorConfig,

    /// Breaker parameters applied to every instance
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Instance selection strategy
    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,

    /// GET response cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Bearer token validation
    #[serde(default)]
    pub auth: AuthConfig,

    /// Which downstream statuses count as breaker failures
    #[serde(default)]
    pub outcome_policy: OutcomePolicy,

    /// Log level and format
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics export
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Backend service descriptors
    pub services: Vec<ServiceDescriptor>,

    /// Ordered route table; derived from the descriptors when empty
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the gateway listens on
    pub bind_address: String,

    /// Maximum buffered request body in bytes
    pub max_body_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorConfig {
    /// Tick interval between probe rounds
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Deadline for a single probe
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum probes in flight at once
    pub max_concurrency: usize,

    /// Probes slower than this mark the instance degraded
    #[serde(with = "humantime_serde")]
    pub degraded_latency: Option<Duration>,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            max_concurrency: 16,
            degraded_latency: None,
        }
    }
}

/// Load balancing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    /// Weighted random over `priority / latency`
    #[default]
    WeightedLatency,
    /// Rotate through eligible instances
    RoundRobin,
}

/// Load balancing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub strategy: BalancingStrategy,

    /// Latency assumed for instances with no observations yet
    #[serde(with = "humantime_serde")]
    pub neutral_latency: Duration,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            strategy: BalancingStrategy::WeightedLatency,
            neutral_latency: Duration::from_millis(100),
        }
    }
}

/// Response cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// TTL for routes that do not set their own
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    pub max_entries: usize,

    /// How often expired entries are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(5),
            max_entries: 10_000,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// JWT validation settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 shared secret
    pub jwt_secret: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

/// Classification of downstream responses for breaker purposes
///
/// 5xx responses are always failures. Everything else is a success unless listed
/// in `failure_statuses` (for example `408` or `429`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OutcomePolicy {
    pub failure_statuses: Vec<u16>,
}

impl OutcomePolicy {
    pub fn classify(&self, status: StatusCode) -> Outcome {
        if status.is_server_error() || self.failure_statuses.contains(&status.as_u16()) {
            Outcome::Failure
        } else {
            Outcome::Success
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Metrics export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
        }
    }
}

/// Wire protocol spoken to a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVersion {
    #[default]
    Http1,
    Http2,
}

/// Per-service token bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Requests allowed per window
    pub requests: u32,

    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Bucket capacity, defaults to `requests`
    #[serde(default)]
    pub burst: Option<u32>,
}

/// Static configuration for one logical backend service
///
/// Immutable once loaded; instances hold it behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,

    /// Address of the first instance
    pub base_address: Url,

    /// Addresses of further instances
    #[serde(default)]
    pub replicas: Vec<Url>,

    pub path_prefix: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Deadline for each proxied call
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Extra attempts after a network failure or 5xx
    #[serde(default)]
    pub retries: u32,

    /// Load-balancing priority weight
    #[serde(default = "default_priority")]
    pub priority: f64,

    #[serde(default)]
    pub protocol_version: ProtocolVersion,

    #[serde(default)]
    pub auth_required: bool,

    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_priority() -> f64 {
    1.0
}

impl ServiceDescriptor {
    /// Build a descriptor with defaults for everything but the essentials
    pub fn new(name: impl Into<String>, base_address: Url, path_prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_address,
            replicas: Vec::new(),
            path_prefix: path_prefix.into(),
            health_path: default_health_path(),
            timeout: default_timeout(),
            retries: 0,
            priority: default_priority(),
            protocol_version: ProtocolVersion::default(),
            auth_required: false,
            rate_limit: None,
        }
    }

    /// All instance addresses, base first
    pub fn addresses(&self) -> impl Iterator<Item = &Url> {
        std::iter::once(&self.base_address).chain(self.replicas.iter())
    }
}

/// One entry of the ordered route table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub path_prefix: String,
    pub service: String,

    /// Remove the prefix before forwarding
    #[serde(default)]
    pub strip_prefix: bool,

    /// Serve GETs from the response cache
    #[serde(default)]
    pub cacheable: bool,

    #[serde(default, with = "humantime_serde")]
    pub cache_ttl: Option<Duration>,
}

impl RouteDefinition {
    pub fn new(path_prefix: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            service: service.into(),
            strip_prefix: false,
            cacheable: false,
            cache_ttl: None,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file, apply env overrides and validate
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML without overrides or validation
    pub fn from_yaml_str(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
    }

    /// Apply environment variable overrides
    ///
    /// Recognised variables: `GATEWAY_BIND_ADDRESS`, `GATEWAY_HEALTH_INTERVAL`,
    /// `GATEWAY_LOG_LEVEL`, `GATEWAY_LOG_FORMAT`, `GATEWAY_JWT_SECRET`.
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(addr) = env::var("GATEWAY_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Ok(interval) = env::var("GATEWAY_HEALTH_INTERVAL") {
            self.health.interval = humantime::parse_duration(&interval).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_HEALTH_INTERVAL: {}", e))
            })?;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(GatewayError::config(format!(
                        "Invalid GATEWAY_LOG_FORMAT: {}",
                        other
                    )))
                }
            };
        }

        if let Ok(secret) = env::var("GATEWAY_JWT_SECRET") {
            self.auth.jwt_secret = Some(secret);
        }

        Ok(())
    }

    /// Routes in match order; falls back to one route per descriptor prefix
    pub fn effective_routes(&self) -> Vec<RouteDefinition> {
        if !self.routes.is_empty() {
            return self.routes.clone();
        }
        self.services
            .iter()
            .map(|service| RouteDefinition::new(service.path_prefix.clone(), service.name.clone()))
            .collect()
    }

    /// Look up a descriptor by name
    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|service| service.name == name)
    }

    /// Validate the configuration
    pub fn validate(&self) -> GatewayResult<()> {
        self.server
            .bind_address
            .parse::<SocketAddr>()
            .map_err(|e| {
                GatewayError::config(format!(
                    "Invalid bind address '{}': {}",
                    self.server.bind_address, e
                ))
            })?;

        if self.health.interval.is_zero() || self.health.timeout.is_zero() {
            return Err(GatewayError::config(
                "Health interval and timeout must be greater than zero",
            ));
        }
        if self.health.max_concurrency == 0 {
            return Err(GatewayError::config("Health max_concurrency must be at least 1"));
        }

        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0
            || breaker.success_threshold == 0
            || breaker.half_open_max_trials == 0
        {
            return Err(GatewayError::config(
                "Circuit breaker thresholds and half_open_max_trials must be at least 1",
            ));
        }
        if breaker.open_timeout.is_zero() {
            return Err(GatewayError::config("Circuit breaker open_timeout must be greater than zero"));
        }

        if self.cache.enabled
            && (self.cache.default_ttl.is_zero()
                || self.cache.max_entries == 0
                || self.cache.sweep_interval.is_zero())
        {
            return Err(GatewayError::config(
                "Cache default_ttl, sweep_interval and max_entries must be greater than zero",
            ));
        }

        if self.services.is_empty() {
            return Err(GatewayError::config("At least one service must be configured"));
        }

        for service in &self.services {
            Self::validate_service(service)?;
        }

        if self.services.iter().any(|s| s.auth_required) && self.auth.jwt_secret.is_none() {
            return Err(GatewayError::config(
                "auth.jwt_secret is required when a service sets auth_required",
            ));
        }

        let names: HashSet<&str> = self.services.iter().map(|s| s.name.as_str()).collect();
        let authenticated: HashSet<&str> = self
            .services
            .iter()
            .filter(|s| s.auth_required)
            .map(|s| s.name.as_str())
            .collect();
        for route in &self.effective_routes() {
            if !route.path_prefix.starts_with('/') {
                return Err(GatewayError::config(format!(
                    "Route prefix '{}' must start with '/'",
                    route.path_prefix
                )));
            }
            if !names.contains(route.service.as_str()) {
                return Err(GatewayError::config(format!(
                    "Route '{}' references unknown service '{}'",
                    route.path_prefix, route.service
                )));
            }
            // Cache keys carry no caller identity
            if route.cacheable && authenticated.contains(route.service.as_str()) {
                return Err(GatewayError::config(format!(
                    "Route '{}' cannot be cacheable: service '{}' requires auth",
                    route.path_prefix, route.service
                )));
            }
        }

        Ok(())
    }

    fn validate_service(service: &ServiceDescriptor) -> GatewayResult<()> {
        if service.name.trim().is_empty() {
            return Err(GatewayError::config("Service name cannot be empty"));
        }

        for address in service.addresses() {
            if !matches!(address.scheme(), "http" | "https") {
                return Err(GatewayError::config(format!(
                    "Service '{}' address '{}' must use http or https",
                    service.name, address
                )));
            }
        }

        if !service.path_prefix.starts_with('/') || !service.health_path.starts_with('/') {
            return Err(GatewayError::config(format!(
                "Service '{}' path_prefix and health_path must start with '/'",
                service.name
            )));
        }

        if service.timeout.is_zero() {
            return Err(GatewayError::config(format!(
                "Service '{}' timeout must be greater than zero",
                service.name
            )));
        }

        if !service.priority.is_finite() || service.priority <= 0.0 {
            return Err(GatewayError::config(format!(
                "Service '{}' priority must be a positive number",
                service.name
            )));
        }

        if let Some(limit) = &service.rate_limit {
            if limit.requests == 0 || limit.window.is_zero() || limit.burst == Some(0) {
                return Err(GatewayError::config(format!(
                    "Service '{}' rate limit must allow at least one request per non-zero window",
                    service.name
                )));
            }
        }

        Ok(())
    }
}
