//! # Load Balancer Module
//!
//! Chooses one eligible instance of a service for each dispatch attempt.
//!
//! ## Rust Concepts Explained
//!
//! - `Arc<dyn LoadBalancer>` lets the dispatcher hold any strategy behind one pointer
//! - `AtomicUsize` provides the lock-free rotation counter for round robin
//! - `Send + Sync` on the trait ensures strategies can be shared between tasks
//!
//! ## Load Balancing Algorithms
//!
//! 1. **Weighted latency** (default): every eligible instance gets weight
//!    `priority / (latency_ms + 1)` and one is drawn at random in proportion to its
//!    weight. Fast instances attract more traffic; slow ones still see some, so their
//!    latency estimate keeps moving.
//! 2. **Round robin**: rotates through the eligible instances.
//!
//! Eligibility (healthy status and an admitting breaker) is decided before the
//! strategy runs; strategies only ever see eligible instances.

use dashmap::DashMap;
use metrics::counter;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::config::{BalancingStrategy, LoadBalancingConfig};
use crate::discovery::{ServiceInstance, ServiceRegistry};

/// Added to latency so a zero-millisecond observation never divides by zero
const LATENCY_EPSILON_MS: f64 = 1.0;

/// Strategy for picking among eligible instances
pub trait LoadBalancer: Send + Sync {
    /// Pick an index into `instances`, or `None` when the slice is empty
    fn select(&self, instances: &[Arc<ServiceInstance>]) -> Option<usize>;

    /// Algorithm name for metrics and logging
    fn algorithm_name(&self) -> &'static str;
}

/// Latency-weighted random selection
pub struct WeightedLatencyBalancer {
    neutral_latency: Duration,
}

impl WeightedLatencyBalancer {
    pub fn new(neutral_latency: Duration) -> Self {
        Self { neutral_latency }
    }

    /// Selection weight of one instance
    pub fn weight(&self, instance: &ServiceInstance) -> f64 {
        let latency = instance
            .observed_latency()
            .unwrap_or(self.neutral_latency);
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let priority = instance.descriptor().priority.max(0.0);
        priority / (latency_ms + LATENCY_EPSILON_MS)
    }

    /// Deterministic core of the draw
    ///
    /// `draw` is a uniform sample in `[0, 1)`. Falls back to the first instance when
    /// rounding leaves the cumulative sum short of the target, or when every weight is
    /// zero.
    pub fn select_with_draw(&self, instances: &[Arc<ServiceInstance>], draw: f64) -> Option<usize> {
        if instances.is_empty() {
            return None;
        }

        let weights: Vec<f64> = instances.iter().map(|i| self.weight(i)).collect();
        let total: f64 = weights.iter().sum();
        if !(total > 0.0) || !total.is_finite() {
            return Some(0);
        }

        let target = draw.clamp(0.0, 1.0) * total;
        let mut cumulative = 0.0;
        for (index, weight) in weights.iter().enumerate() {
            cumulative += weight;
            if target < cumulative {
                return Some(index);
            }
        }
        Some(0)
    }
}

impl LoadBalancer for WeightedLatencyBalancer {
    fn select(&self, instances: &[Arc<ServiceInstance>]) -> Option<usize> {
        let draw: f64 = rand::thread_rng().gen();
        self.select_with_draw(instances, draw)
    }

    fn algorithm_name(&self) -> &'static str {
        "weighted_latency"
    }
}

/// Round-robin load balancer with atomic counter
///
/// The counter wraps on overflow, which only shifts the rotation by one.
#[derive(Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(&self, instances: &[Arc<ServiceInstance>]) -> Option<usize> {
        if instances.is_empty() {
            return None;
        }
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % instances.len())
    }

    fn algorithm_name(&self) -> &'static str {
        "round_robin"
    }
}

/// Build the configured strategy
pub fn create_load_balancer(config: &LoadBalancingConfig) -> Arc<dyn LoadBalancer> {
    match config.strategy {
        BalancingStrategy::WeightedLatency => {
            Arc::new(WeightedLatencyBalancer::new(config.neutral_latency))
        }
        BalancingStrategy::RoundRobin => Arc::new(RoundRobinBalancer::new()),
    }
}

/// Per-service selection statistics
#[derive(Debug, Clone, Serialize)]
pub struct SelectionStats {
    pub selections: u64,
    pub failed_selections: u64,
}

#[derive(Default)]
struct SelectionCounters {
    selections: AtomicU64,
    failed_selections: AtomicU64,
}

/// Filters a service's instances down to the eligible ones and applies the strategy
pub struct InstanceSelector {
    registry: Arc<ServiceRegistry>,
    balancer: Arc<dyn LoadBalancer>,
    stats: DashMap<String, SelectionCounters>,
}

impl InstanceSelector {
    pub fn new(registry: Arc<ServiceRegistry>, balancer: Arc<dyn LoadBalancer>) -> Self {
        Self {
            registry,
            balancer,
            stats: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Select an instance of `service_name`
    ///
    /// Returns `None` when the service is unknown or when no instance is healthy with
    /// a breaker that would admit a call. Does not take a breaker permit.
    pub fn select_instance(&self, service_name: &str) -> Option<Arc<ServiceInstance>> {
        let eligible: Vec<Arc<ServiceInstance>> = self
            .registry
            .list_instances(service_name)
            .into_iter()
            .filter(|instance| instance.is_eligible())
            .collect();

        let counters = self.stats.entry(service_name.to_string()).or_default();

        let Some(index) = self.balancer.select(&eligible) else {
            counters.failed_selections.fetch_add(1, Ordering::Relaxed);
            counter!("load_balancer_failed_selections", "service" => service_name.to_string())
                .increment(1);
            debug!(service = %service_name, "No eligible instance to select");
            return None;
        };

        counters.selections.fetch_add(1, Ordering::Relaxed);
        counter!(
            "load_balancer_selections",
            "service" => service_name.to_string(),
            "algorithm" => self.balancer.algorithm_name()
        )
        .increment(1);

        let selected = Arc::clone(&eligible[index]);
        debug!(
            instance_id = %selected.id,
            instance_address = %selected.address,
            algorithm = self.balancer.algorithm_name(),
            candidates = eligible.len(),
            "Selected instance for load balancing"
        );
        Some(selected)
    }

    pub fn stats(&self, service_name: &str) -> SelectionStats {
        self.stats
            .get(service_name)
            .map(|c| SelectionStats {
                selections: c.selections.load(Ordering::Relaxed),
                failed_selections: c.failed_selections.load(Ordering::Relaxed),
            })
            .unwrap_or(SelectionStats {
                selections: 0,
                failed_selections: 0,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::{CircuitBreakerConfig, Outcome};
    use crate::core::config::ServiceDescriptor;
    use crate::discovery::{InstanceStatus, ProbeReport};
    use std::collections::HashMap;
    use url::Url;

    fn registry_with(latencies_ms: &[u64]) -> Arc<ServiceRegistry> {
        let mut descriptor = ServiceDescriptor::new(
            "orders",
            Url::parse("http://orders-0:3000").unwrap(),
            "/api/orders",
        );
        descriptor.replicas = (1..latencies_ms.len())
            .map(|i| Url::parse(&format!("http://orders-{}:3000", i)).unwrap())
            .collect();

        let registry = Arc::new(ServiceRegistry::from_descriptors(
            vec![descriptor],
            CircuitBreakerConfig::default(),
        ));
        for (instance, latency) in registry.list_instances("orders").iter().zip(latencies_ms) {
            instance.record_probe(ProbeReport {
                status: InstanceStatus::Healthy,
                latency: Duration::from_millis(*latency),
                uptime: None,
                version: None,
            });
        }
        registry
    }

    #[test]
    fn test_weight_prefers_low_latency() {
        let registry = registry_with(&[10, 100]);
        let instances = registry.list_instances("orders");
        let balancer = WeightedLatencyBalancer::new(Duration::from_millis(100));

        let fast = balancer.weight(&instances[0]);
        let slow = balancer.weight(&instances[1]);
        assert!((fast - 1.0 / 11.0).abs() < 1e-9);
        assert!((slow - 1.0 / 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_unobserved_instance_uses_neutral_latency() {
        let registry = Arc::new(ServiceRegistry::new(CircuitBreakerConfig::default()));
        let instance = registry.register(Arc::new(ServiceDescriptor::new(
            "users",
            Url::parse("http://users:3000").unwrap(),
            "/api/users",
        )));
        let balancer = WeightedLatencyBalancer::new(Duration::from_millis(100));
        assert!((balancer.weight(&instance) - 1.0 / 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_draw_maps_onto_cumulative_weights() {
        let registry = registry_with(&[0, 0]);
        let instances = registry.list_instances("orders");
        let balancer = WeightedLatencyBalancer::new(Duration::from_millis(100));

        assert_eq!(balancer.select_with_draw(&instances, 0.0), Some(0));
        assert_eq!(balancer.select_with_draw(&instances, 0.49), Some(0));
        assert_eq!(balancer.select_with_draw(&instances, 0.51), Some(1));
        assert_eq!(balancer.select_with_draw(&instances, 1.0), Some(0));
        assert_eq!(balancer.select_with_draw(&[], 0.3), None);
    }

    #[test]
    fn test_selection_converges_to_weight_ratio() {
        let registry = registry_with(&[10, 100]);
        let selector = InstanceSelector::new(
            Arc::clone(&registry),
            Arc::new(WeightedLatencyBalancer::new(Duration::from_millis(100))),
        );

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..10_000 {
            let instance = selector.select_instance("orders").unwrap();
            *counts.entry(instance.id.clone()).or_default() += 1;
        }

        let fast = counts["orders-0"] as f64;
        let slow = counts["orders-1"] as f64;
        let ratio = fast / slow;
        let expected = 101.0 / 11.0;
        assert!(
            (ratio - expected).abs() / expected < 0.25,
            "ratio {} too far from {}",
            ratio,
            expected
        );
    }

    #[test]
    fn test_ineligible_instances_are_skipped() {
        let registry = registry_with(&[10, 10]);
        let instances = registry.list_instances("orders");

        instances[0].record_probe(ProbeReport {
            status: InstanceStatus::Unhealthy,
            latency: Duration::from_secs(2),
            uptime: None,
            version: None,
        });
        for _ in 0..5 {
            instances[1].breaker().report(Outcome::Failure);
        }

        let selector = InstanceSelector::new(
            Arc::clone(&registry),
            Arc::new(WeightedLatencyBalancer::new(Duration::from_millis(100))),
        );
        assert!(selector.select_instance("orders").is_none());
        assert!(selector.select_instance("unknown").is_none());
        assert_eq!(selector.stats("orders").failed_selections, 1);
    }

    #[test]
    fn test_round_robin_rotates() {
        let registry = registry_with(&[10, 10, 10]);
        let selector =
            InstanceSelector::new(Arc::clone(&registry), Arc::new(RoundRobinBalancer::new()));

        let ids: Vec<String> = (0..4)
            .map(|_| selector.select_instance("orders").unwrap().id.clone())
            .collect();
        assert_eq!(ids, vec!["orders-0", "orders-1", "orders-2", "orders-0"]);
        assert_eq!(selector.stats("orders").selections, 4);
    }
}
