//! Post-dispatch hooks.
//!
//! After every dispatch attempt the dispatcher hands each registered hook the
//! instance that served the attempt and a [`DispatchOutcome`]. Hooks observe; they
//! do not change the response and they do not drive the circuit breaker (the
//! dispatcher reports to the breaker through its admission permit).

use std::time::Duration;

use crate::core::circuit_breaker::Outcome;
use crate::discovery::ServiceInstance;
use crate::observability::metrics::record_upstream_request;

/// Result of one dispatch attempt
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub correlation_id: String,
    pub service: String,
    pub instance_id: String,
    /// Downstream status, `None` when no response arrived
    pub status: Option<u16>,
    pub latency: Duration,
    /// Breaker classification of the attempt
    pub outcome: Outcome,
    /// Transport error message, if the call failed before a response
    pub error: Option<String>,
}

pub trait DispatchHook: Send + Sync {
    fn after_dispatch(&self, instance: &ServiceInstance, outcome: &DispatchOutcome);
}

/// Updates per-instance metrics and exports upstream counters
#[derive(Debug, Default)]
pub struct MetricsHook;

impl DispatchHook for MetricsHook {
    fn after_dispatch(&self, instance: &ServiceInstance, outcome: &DispatchOutcome) {
        instance.metrics().record(outcome.outcome, outcome.latency);
        instance.record_dispatch(outcome.outcome);
        record_upstream_request(
            &outcome.service,
            &outcome.instance_id,
            outcome.status,
            outcome.latency,
            !outcome.outcome.is_success(),
        );
    }
}
