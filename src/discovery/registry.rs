//! # Service Registry
//!
//! In-memory directory of configured services and their running instances.
//!
//! The registry is an explicitly owned object: it is built once at startup and handed
//! (as `Arc<ServiceRegistry>`) to the health monitor, the load balancer and the
//! dispatcher. Services are stored in a `DashMap` keyed by name, so updates to one
//! service never contend with lookups of another, and each instance carries its own
//! locks for status, breaker and metrics.
//!
//! Instances are fully constructed before they are inserted, and lookups return
//! cloned `Arc`s, so a reader only ever sees complete instances.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::core::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, Outcome,
};
use crate::core::config::ServiceDescriptor;

/// Smoothing factor for the rolling error rate and average latency
const EWMA_ALPHA: f64 = 0.2;

/// Runtime health of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Not probed yet
    Unknown,
    Healthy,
    Unhealthy,
    /// Reachable but reporting reduced service
    Degraded,
}

/// Mutable health data written by the health monitor and dispatch outcomes
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    pub status: InstanceStatus,
    pub last_check: Option<DateTime<Utc>>,
    /// Latency of the most recent probe
    #[serde(with = "humantime_serde")]
    pub last_latency: Option<Duration>,
    /// Exponentially weighted share of failed calls, 0.0 to 1.0
    pub error_rate: f64,
    /// Uptime in seconds as reported by the instance
    pub uptime: Option<f64>,
    pub version: Option<String>,
}

impl Default for InstanceHealth {
    fn default() -> Self {
        Self {
            status: InstanceStatus::Unknown,
            last_check: None,
            last_latency: None,
            error_rate: 0.0,
            uptime: None,
            version: None,
        }
    }
}

/// Aggregate request metrics for one instance
///
/// Monotonic counters plus last/smoothed latency. Only used for observability and
/// load-balancer weighting.
#[derive(Debug, Default)]
pub struct InstanceMetrics {
    total_requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    last_latency_us: AtomicU64,
    /// f64 bits of the smoothed latency in milliseconds
    average_latency_ms: AtomicU64,
}

/// Serializable copy of [`InstanceMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct InstanceMetricsSnapshot {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_latency_ms: f64,
    pub average_latency_ms: f64,
}

impl InstanceMetrics {
    /// Record one completed dispatch
    pub fn record(&self, outcome: Outcome, latency: Duration) {
        let previous = self.total_requests.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Outcome::Success => self.successes.fetch_add(1, Ordering::Relaxed),
            Outcome::Failure => self.failures.fetch_add(1, Ordering::Relaxed),
        };
        self.last_latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);

        let sample = latency.as_secs_f64() * 1000.0;
        let _ = self
            .average_latency_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let current = f64::from_bits(bits);
                let next = if previous == 0 {
                    sample
                } else {
                    current + EWMA_ALPHA * (sample - current)
                };
                Some(next.to_bits())
            });
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Smoothed dispatch latency, if any request has completed
    pub fn average_latency(&self) -> Option<Duration> {
        if self.total_requests() == 0 {
            return None;
        }
        let ms = f64::from_bits(self.average_latency_ms.load(Ordering::Relaxed));
        Some(Duration::from_secs_f64(ms.max(0.0) / 1000.0))
    }

    pub fn snapshot(&self) -> InstanceMetricsSnapshot {
        InstanceMetricsSnapshot {
            total_requests: self.total_requests(),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_latency_ms: self.last_latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
            average_latency_ms: f64::from_bits(self.average_latency_ms.load(Ordering::Relaxed)),
        }
    }
}

/// One running, addressable replica of a service
#[derive(Debug)]
pub struct ServiceInstance {
    pub id: String,
    pub address: Url,
    descriptor: Arc<ServiceDescriptor>,
    health: RwLock<InstanceHealth>,
    breaker: CircuitBreaker,
    metrics: InstanceMetrics,
    probe_in_flight: AtomicBool,
}

impl ServiceInstance {
    fn new(
        id: String,
        address: Url,
        descriptor: Arc<ServiceDescriptor>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(id.clone(), breaker_config);
        Self {
            id,
            address,
            descriptor,
            health: RwLock::new(InstanceHealth::default()),
            breaker,
            metrics: InstanceMetrics::default(),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    /// Name of the owning service
    pub fn service_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &Arc<ServiceDescriptor> {
        &self.descriptor
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn metrics(&self) -> &InstanceMetrics {
        &self.metrics
    }

    pub fn status(&self) -> InstanceStatus {
        self.health.read().status
    }

    pub fn health(&self) -> InstanceHealth {
        self.health.read().clone()
    }

    /// Selection eligibility: healthy and the breaker would admit a call
    pub fn is_eligible(&self) -> bool {
        self.status() == InstanceStatus::Healthy && self.breaker.is_available()
    }

    /// Latency used for load-balancer weighting
    pub fn observed_latency(&self) -> Option<Duration> {
        self.metrics
            .average_latency()
            .or_else(|| self.health.read().last_latency)
    }

    /// Resolve a request path and query against this instance's address
    pub fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.address.clone();
        let base = self.address.path().trim_end_matches('/');
        url.set_path(&format!("{}{}", base, path));
        url.set_query(query);
        url
    }

    /// Apply a probe result to status and error rate
    pub fn record_probe(&self, report: ProbeReport) {
        let mut health = self.health.write();
        let previous = health.status;

        health.status = report.status;
        health.last_check = Some(Utc::now());
        if report.status != InstanceStatus::Unhealthy {
            health.last_latency = Some(report.latency);
        }
        if report.uptime.is_some() {
            health.uptime = report.uptime;
        }
        if report.version.is_some() {
            health.version = report.version;
        }
        let failed = report.status == InstanceStatus::Unhealthy;
        health.error_rate = ewma(health.error_rate, failed);
        drop(health);

        if previous != report.status {
            info!(
                instance_id = %self.id,
                service = %self.service_name(),
                from = ?previous,
                to = ?report.status,
                "Instance health status changed"
            );
        }
    }

    /// Fold a dispatch outcome into the rolling error rate
    pub fn record_dispatch(&self, outcome: Outcome) {
        let mut health = self.health.write();
        health.error_rate = ewma(health.error_rate, !outcome.is_success());
    }

    /// Claim the probe slot; false if a probe from an earlier tick is still running
    pub fn begin_probe(&self) -> bool {
        self.probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_probe(&self) {
        self.probe_in_flight.store(false, Ordering::Release);
    }

    /// Serializable view for the discovery endpoint
    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id.clone(),
            address: self.address.to_string(),
            health: self.health(),
            breaker: self.breaker.snapshot(),
            metrics: self.metrics.snapshot(),
        }
    }
}

fn ewma(current: f64, failed: bool) -> f64 {
    let sample = if failed { 1.0 } else { 0.0 };
    current + EWMA_ALPHA * (sample - current)
}

/// Result of one health probe
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub status: InstanceStatus,
    pub latency: Duration,
    pub uptime: Option<f64>,
    pub version: Option<String>,
}

/// Per-instance entry of `GET /services`
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub address: String,
    #[serde(flatten)]
    pub health: InstanceHealth,
    pub breaker: CircuitBreakerSnapshot,
    pub metrics: InstanceMetricsSnapshot,
}

/// Directory of services and their instances
pub struct ServiceRegistry {
    services: DashMap<String, Vec<Arc<ServiceInstance>>>,
    breaker_config: CircuitBreakerConfig,
}

impl ServiceRegistry {
    /// Create an empty registry; every instance gets a breaker with `breaker_config`
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            services: DashMap::new(),
            breaker_config,
        }
    }

    /// Register one instance per configured address of each descriptor
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ServiceDescriptor>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let registry = Self::new(breaker_config);
        for descriptor in descriptors {
            let descriptor = Arc::new(descriptor);
            for address in descriptor.addresses() {
                registry.register_at(Arc::clone(&descriptor), address.clone());
            }
        }
        registry
    }

    /// Register an instance at the descriptor's base address
    pub fn register(&self, descriptor: Arc<ServiceDescriptor>) -> Arc<ServiceInstance> {
        let address = descriptor.base_address.clone();
        self.register_at(descriptor, address)
    }

    /// Register an instance at an explicit address
    ///
    /// The new instance starts with status `Unknown` and a `Closed` breaker. If the
    /// service already has an instance at this address it is replaced and keeps its id.
    pub fn register_at(&self, descriptor: Arc<ServiceDescriptor>, address: Url) -> Arc<ServiceInstance> {
        let mut entry = self.services.entry(descriptor.name.clone()).or_default();

        let existing = entry.iter().position(|instance| instance.address == address);
        let id = match existing {
            Some(index) => entry[index].id.clone(),
            None => format!("{}-{}", descriptor.name, entry.len()),
        };

        let instance = Arc::new(ServiceInstance::new(
            id,
            address,
            descriptor,
            self.breaker_config.clone(),
        ));

        match existing {
            Some(index) => {
                debug!(instance_id = %instance.id, "Replacing re-registered instance");
                entry[index] = Arc::clone(&instance);
            }
            None => entry.push(Arc::clone(&instance)),
        }

        info!(
            instance_id = %instance.id,
            service = %instance.service_name(),
            address = %instance.address,
            "Registered service instance"
        );
        instance
    }

    /// Instances of a service; empty for unknown names
    pub fn list_instances(&self, service_name: &str) -> Vec<Arc<ServiceInstance>> {
        self.services
            .get(service_name)
            .map(|instances| instances.clone())
            .unwrap_or_default()
    }

    /// Every service with its instances, ordered by service name
    pub fn all_services(&self) -> BTreeMap<String, Vec<Arc<ServiceInstance>>> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Flat list of every registered instance
    pub fn all_instances(&self) -> Vec<Arc<ServiceInstance>> {
        self.services
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> Arc<ServiceDescriptor> {
        Arc::new(ServiceDescriptor::new(
            name,
            Url::parse(&format!("http://{}-0:3000", name)).unwrap(),
            format!("/api/{}", name),
        ))
    }

    #[test]
    fn test_register_creates_unknown_instance_with_closed_breaker() {
        let registry = ServiceRegistry::new(CircuitBreakerConfig::default());
        let instance = registry.register(descriptor("orders"));

        assert_eq!(instance.id, "orders-0");
        assert_eq!(instance.status(), InstanceStatus::Unknown);
        assert_eq!(instance.breaker().snapshot().state, "CLOSED");
        assert!(!instance.is_eligible());
        assert_eq!(registry.list_instances("orders").len(), 1);
    }

    #[test]
    fn test_unknown_service_yields_empty_list() {
        let registry = ServiceRegistry::new(CircuitBreakerConfig::default());
        assert!(registry.list_instances("nope").is_empty());
    }

    #[test]
    fn test_from_descriptors_registers_replicas() {
        let mut orders = ServiceDescriptor::new(
            "orders",
            Url::parse("http://orders-0:3000").unwrap(),
            "/api/orders",
        );
        orders.replicas = vec![
            Url::parse("http://orders-1:3000").unwrap(),
            Url::parse("http://orders-2:3000").unwrap(),
        ];
        let catalog = ServiceDescriptor::new(
            "catalog",
            Url::parse("http://catalog:3000").unwrap(),
            "/api/catalog",
        );

        let registry =
            ServiceRegistry::from_descriptors(vec![orders, catalog], CircuitBreakerConfig::default());

        let ids: Vec<String> = registry
            .list_instances("orders")
            .iter()
            .map(|i| i.id.clone())
            .collect();
        assert_eq!(ids, vec!["orders-0", "orders-1", "orders-2"]);

        let all = registry.all_services();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["catalog", "orders"]);
        assert_eq!(registry.all_instances().len(), 4);
    }

    #[test]
    fn test_re_registration_replaces_instance() {
        let registry = ServiceRegistry::new(CircuitBreakerConfig::default());
        let first = registry.register(descriptor("orders"));
        first.record_probe(ProbeReport {
            status: InstanceStatus::Healthy,
            latency: Duration::from_millis(5),
            uptime: None,
            version: None,
        });

        let second = registry.register(descriptor("orders"));

        assert_eq!(second.id, first.id);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.status(), InstanceStatus::Unknown);
        assert_eq!(registry.list_instances("orders").len(), 1);
    }

    #[test]
    fn test_probe_updates_status_and_error_rate() {
        let registry = ServiceRegistry::new(CircuitBreakerConfig::default());
        let instance = registry.register(descriptor("orders"));

        instance.record_probe(ProbeReport {
            status: InstanceStatus::Unhealthy,
            latency: Duration::from_millis(2000),
            uptime: None,
            version: None,
        });
        let health = instance.health();
        assert_eq!(health.status, InstanceStatus::Unhealthy);
        assert!((health.error_rate - 0.2).abs() < 1e-9);
        assert!(health.last_latency.is_none());

        instance.record_probe(ProbeReport {
            status: InstanceStatus::Healthy,
            latency: Duration::from_millis(12),
            uptime: Some(3600.0),
            version: Some("1.4.2".to_string()),
        });
        let health = instance.health();
        assert_eq!(health.status, InstanceStatus::Healthy);
        assert!(health.error_rate < 0.2);
        assert_eq!(health.version.as_deref(), Some("1.4.2"));
        assert!(instance.is_eligible());
    }

    #[test]
    fn test_metrics_smooth_latency() {
        let metrics = InstanceMetrics::default();
        assert!(metrics.average_latency().is_none());

        metrics.record(Outcome::Success, Duration::from_millis(100));
        assert_eq!(metrics.average_latency(), Some(Duration::from_millis(100)));

        metrics.record(Outcome::Failure, Duration::from_millis(200));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.failures, 1);
        assert!((snapshot.average_latency_ms - 120.0).abs() < 1e-6);
        assert!((snapshot.last_latency_ms - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_target_url_joins_base_path() {
        let registry = ServiceRegistry::new(CircuitBreakerConfig::default());
        let mut d = ServiceDescriptor::new(
            "users",
            Url::parse("http://users:3000/v1/").unwrap(),
            "/api/users",
        );
        d.replicas.clear();
        let instance = registry.register(Arc::new(d));

        let url = instance.target_url("/api/users/7", Some("expand=true"));
        assert_eq!(url.as_str(), "http://users:3000/v1/api/users/7?expand=true");
    }

    #[test]
    fn test_probe_slot_is_exclusive() {
        let registry = ServiceRegistry::new(CircuitBreakerConfig::default());
        let instance = registry.register(descriptor("orders"));

        assert!(instance.begin_probe());
        assert!(!instance.begin_probe());
        instance.end_probe();
        assert!(instance.begin_probe());
    }
}
