//! # Metrics Collection
//!
//! Installs the Prometheus recorder behind the `metrics` facade and provides the
//! recording helpers used by the server, dispatcher and health monitor.
//!
//! Every `counter!`/`histogram!`/`gauge!` call in the crate goes through the facade,
//! so code never holds a recorder handle. Without an installed recorder those calls
//! are no-ops, which is what unit tests rely on.
//!
//! ## Metric names
//! - `gateway_requests_total`, `gateway_request_duration_seconds` (inbound)
//! - `gateway_upstream_requests_total`, `gateway_upstream_request_duration_seconds`,
//!   `gateway_upstream_errors_total` (per dispatch attempt)
//! - `gateway_circuit_breaker_transitions_total` (label `to`)
//! - `load_balancer_selections`, `load_balancer_failed_selections`
//! - `health_checks_total`, `health_check_duration_seconds`
//! - `cache_hits_total`, `cache_misses_total`, `rate_limit_denied_total`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Latency buckets shared by every duration histogram, in seconds
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Errors that can occur during metrics operations
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to initialize metrics exporter: {0}")]
    InitializationError(String),
}

/// Install the global Prometheus recorder and return the handle that renders it
///
/// Can only succeed once per process.
pub fn install_recorder() -> Result<PrometheusHandle, MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), LATENCY_BUCKETS)
        .map_err(|e| MetricsError::InitializationError(format!("Failed to set histogram buckets: {}", e)))?
        .install_recorder()
        .map_err(|e| MetricsError::InitializationError(e.to_string()))?;

    info!("Prometheus metrics recorder installed");
    Ok(handle)
}

/// Record one inbound request as answered by the gateway
pub fn record_request(method: &str, service: &str, status_code: u16, duration: Duration) {
    let method = method.to_string();
    let service = service.to_string();
    let status = status_code.to_string();

    metrics::counter!(
        "gateway_requests_total",
        "method" => method.clone(),
        "service" => service.clone(),
        "status_code" => status.clone()
    )
    .increment(1);
    metrics::histogram!(
        "gateway_request_duration_seconds",
        "method" => method,
        "service" => service,
        "status_code" => status
    )
    .record(duration.as_secs_f64());
}

/// Record one dispatch attempt against an upstream instance
///
/// `status_code` is `None` when no response was received (timeout or connect error).
pub fn record_upstream_request(
    service: &str,
    instance_id: &str,
    status_code: Option<u16>,
    duration: Duration,
    failed: bool,
) {
    let service = service.to_string();
    let instance = instance_id.to_string();
    let status = status_code
        .map(|s| s.to_string())
        .unwrap_or_else(|| "none".to_string());

    metrics::counter!(
        "gateway_upstream_requests_total",
        "service" => service.clone(),
        "instance" => instance.clone(),
        "status_code" => status.clone()
    )
    .increment(1);
    metrics::histogram!(
        "gateway_upstream_request_duration_seconds",
        "service" => service.clone(),
        "instance" => instance.clone()
    )
    .record(duration.as_secs_f64());

    if failed {
        metrics::counter!(
            "gateway_upstream_errors_total",
            "service" => service,
            "instance" => instance,
            "status_code" => status
        )
        .increment(1);
    }
}

/// Record the outcome of one health probe
pub fn record_health_check(service: &str, instance_id: &str, status: &'static str, duration: Duration) {
    metrics::counter!(
        "health_checks_total",
        "service" => service.to_string(),
        "instance" => instance_id.to_string(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "health_check_duration_seconds",
        "service" => service.to_string()
    )
    .record(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_request("GET", "orders", 200, Duration::from_millis(5));
        record_upstream_request("orders", "orders-0", None, Duration::from_millis(5), true);
        record_health_check("orders", "orders-0", "healthy", Duration::from_millis(1));
    }
}
