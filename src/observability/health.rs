//! # Health Checking System
//!
//! Background probing of every registered instance, plus the aggregate report served
//! on the gateway's own `/health` endpoint.
//!
//! ## Key Features
//! - One probe per instance per tick, `GET <address><health_path>` bounded by a timeout
//! - Bounded fan-out: at most `max_concurrency` probes run at once, each on its own
//!   task, so a slow instance never holds up the others
//! - A probe still running from an earlier tick is not issued again
//! - Results feed the instance status and the same breaker entry point the dispatcher
//!   uses
//!
//! ## Probe classification
//! - 2xx within the timeout: healthy, or degraded when the JSON body says
//!   `"status": "degraded"` or the latency exceeds `degraded_latency`. The breaker
//!   receives a success either way.
//! - Anything else (non-2xx, timeout, connection error): unhealthy, breaker failure.
//!
//! ## Rust Concepts Used
//! - `Arc<Semaphore>` with owned permits bounds concurrency across spawned tasks
//! - `CancellationToken` stops the background loop on shutdown
//! - `tokio::time::interval` drives the tick

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::circuit_breaker::Outcome;
use crate::core::config::HealthMonitorConfig;
use crate::core::connection_pool::UpstreamClients;
use crate::discovery::{InstanceStatus, ProbeReport, ServiceInstance, ServiceRegistry};
use crate::observability::metrics::record_health_check;

/// Optional JSON body of an instance health endpoint
#[derive(Debug, Default, Deserialize)]
struct HealthBody {
    status: Option<String>,
    uptime: Option<f64>,
    version: Option<String>,
}

/// Periodic prober for every registered instance
pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    clients: UpstreamClients,
    config: HealthMonitorConfig,
    permits: Arc<Semaphore>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        clients: UpstreamClients,
        config: HealthMonitorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            registry,
            clients,
            config,
            permits,
        }
    }

    /// Start one probe per idle instance without waiting for them
    pub fn start_round(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for instance in self.registry.all_instances() {
            if !instance.begin_probe() {
                debug!(instance_id = %instance.id, "Probe still in flight, skipping");
                continue;
            }

            let permits = Arc::clone(&self.permits);
            let client = self
                .clients
                .for_protocol(instance.descriptor().protocol_version)
                .clone();
            let config = self.config.clone();

            handles.push(tokio::spawn(async move {
                let guard = ProbeGuard(instance);
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let report = probe_instance(&client, &guard.0, &config).await;
                apply_report(&guard.0, report);
            }));
        }

        handles
    }

    /// Probe every instance and wait for the results
    pub async fn run_once(&self) {
        join_all(self.start_round()).await;
    }

    /// Run probe rounds every `interval` until `shutdown` is cancelled
    ///
    /// Probes still running at shutdown are aborted and awaited before the task ends.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.config.interval, "Health monitor started");
            let mut probes: Vec<JoinHandle<()>> = Vec::new();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        probes.retain(|probe| !probe.is_finished());
                        let round = self.start_round();
                        debug!(probes = round.len(), "Health probe round started");
                        probes.extend(round);
                    }
                }
            }

            for probe in &probes {
                probe.abort();
            }
            let aborted = join_all(probes)
                .await
                .into_iter()
                .filter(|result| matches!(result, Err(e) if e.is_cancelled()))
                .count();
            info!(aborted_probes = aborted, "Health monitor stopped");
        })
    }
}

/// Clears the instance's in-flight flag however the probe task ends
struct ProbeGuard(Arc<ServiceInstance>);

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.0.end_probe();
    }
}

/// Issue one health probe and classify the result
pub async fn probe_instance(
    client: &reqwest::Client,
    instance: &ServiceInstance,
    config: &HealthMonitorConfig,
) -> ProbeReport {
    let url = instance.target_url(&instance.descriptor().health_path, None);
    let started = Instant::now();

    let result = timeout(config.timeout, async {
        let response = client.get(url.as_str()).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok::<_, reqwest::Error>((status, body))
    })
    .await;
    let latency = started.elapsed();

    match result {
        Ok(Ok((status, body))) if status.is_success() => {
            let parsed: HealthBody = serde_json::from_slice(&body).unwrap_or_default();
            let reports_degraded = parsed
                .status
                .as_deref()
                .map(|s| s.eq_ignore_ascii_case("degraded"))
                .unwrap_or(false);
            let too_slow = config
                .degraded_latency
                .map(|limit| latency > limit)
                .unwrap_or(false);

            ProbeReport {
                status: if reports_degraded || too_slow {
                    InstanceStatus::Degraded
                } else {
                    InstanceStatus::Healthy
                },
                latency,
                uptime: parsed.uptime,
                version: parsed.version,
            }
        }
        Ok(Ok((status, _))) => {
            debug!(instance_id = %instance.id, status = status.as_u16(), "Health probe returned non-2xx");
            unhealthy(latency)
        }
        Ok(Err(e)) => {
            debug!(instance_id = %instance.id, error = %e, "Health probe request failed");
            unhealthy(latency)
        }
        Err(_) => {
            debug!(instance_id = %instance.id, timeout = ?config.timeout, "Health probe timed out");
            unhealthy(latency)
        }
    }
}

fn unhealthy(latency: Duration) -> ProbeReport {
    ProbeReport {
        status: InstanceStatus::Unhealthy,
        latency,
        uptime: None,
        version: None,
    }
}

/// Write a probe result into the instance and its breaker
pub fn apply_report(instance: &ServiceInstance, report: ProbeReport) {
    let outcome = if report.status == InstanceStatus::Unhealthy {
        Outcome::Failure
    } else {
        Outcome::Success
    };
    let label = match report.status {
        InstanceStatus::Healthy => "healthy",
        InstanceStatus::Degraded => "degraded",
        InstanceStatus::Unhealthy => "unhealthy",
        InstanceStatus::Unknown => "unknown",
    };

    record_health_check(instance.service_name(), &instance.id, label, report.latency);
    if outcome == Outcome::Failure && instance.status() != InstanceStatus::Unhealthy {
        warn!(instance_id = %instance.id, service = %instance.service_name(), "Health probe failed");
    }

    instance.record_probe(report);
    instance.breaker().report(outcome);
}

/// Overall health status of the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    /// Every service has at least one healthy instance
    Healthy,
    /// Some, but not all, services have a healthy instance
    Degraded,
    /// No service has a healthy instance
    Unhealthy,
}

/// Per-service instance counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealthSummary {
    pub healthy: usize,
    pub total: usize,
}

/// Aggregated report for `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: GatewayStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    /// Seconds since the gateway started
    pub uptime: u64,
    pub services: BTreeMap<String, ServiceHealthSummary>,
}

impl HealthReport {
    pub fn from_registry(registry: &ServiceRegistry, uptime: Duration) -> Self {
        let services: BTreeMap<String, ServiceHealthSummary> = registry
            .all_services()
            .into_iter()
            .map(|(name, instances)| {
                let healthy = instances
                    .iter()
                    .filter(|i| i.status() == InstanceStatus::Healthy)
                    .count();
                (
                    name,
                    ServiceHealthSummary {
                        healthy,
                        total: instances.len(),
                    },
                )
            })
            .collect();

        let available = services.values().filter(|s| s.healthy > 0).count();
        let status = if !services.is_empty() && available == services.len() {
            GatewayStatus::Healthy
        } else if available > 0 {
            GatewayStatus::Degraded
        } else {
            GatewayStatus::Unhealthy
        };

        Self {
            status,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime: uptime.as_secs(),
            services,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::CircuitBreakerConfig;
    use crate::core::config::ServiceDescriptor;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn monitor_config() -> HealthMonitorConfig {
        HealthMonitorConfig {
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(300),
            max_concurrency: 4,
            degraded_latency: None,
        }
    }

    fn registry_for(server: &MockServer) -> Arc<ServiceRegistry> {
        let registry = Arc::new(ServiceRegistry::new(CircuitBreakerConfig::default()));
        registry.register(Arc::new(ServiceDescriptor::new(
            "orders",
            Url::parse(&server.uri()).unwrap(),
            "/api/orders",
        )));
        registry
    }

    fn monitor(registry: &Arc<ServiceRegistry>) -> HealthMonitor {
        HealthMonitor::new(
            Arc::clone(registry),
            UpstreamClients::new().unwrap(),
            monitor_config(),
        )
    }

    #[tokio::test]
    async fn test_successful_probe_marks_healthy_and_records_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok",
                "uptime": 120.5,
                "version": "2.1.0"
            })))
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        monitor(&registry).run_once().await;

        let instance = &registry.list_instances("orders")[0];
        let health = instance.health();
        assert_eq!(health.status, InstanceStatus::Healthy);
        assert_eq!(health.uptime, Some(120.5));
        assert_eq!(health.version.as_deref(), Some("2.1.0"));
        assert!(health.last_check.is_some());
        assert!(instance.is_eligible());
    }

    #[tokio::test]
    async fn test_degraded_body_marks_degraded_without_breaker_failure() {
        let server = MockServer::start().await;
        Mock::given(path("/health"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "degraded"})),
            )
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        monitor(&registry).run_once().await;

        let instance = &registry.list_instances("orders")[0];
        assert_eq!(instance.status(), InstanceStatus::Degraded);
        assert!(!instance.is_eligible());
        assert_eq!(instance.breaker().snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_failures_open_the_breaker() {
        let server = MockServer::start().await;
        Mock::given(path("/health"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        let monitor = monitor(&registry);
        for _ in 0..5 {
            monitor.run_once().await;
        }

        let instance = &registry.list_instances("orders")[0];
        assert_eq!(instance.status(), InstanceStatus::Unhealthy);
        assert_eq!(instance.breaker().snapshot().state, "OPEN");
        assert!(instance.health().error_rate > 0.5);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        let started = Instant::now();
        monitor(&registry).run_once().await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(
            registry.list_instances("orders")[0].status(),
            InstanceStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_in_flight_probe_is_not_reissued() {
        let server = MockServer::start().await;
        Mock::given(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        let monitor = monitor(&registry);
        let instance = Arc::clone(&registry.list_instances("orders")[0]);

        assert!(instance.begin_probe());
        assert!(monitor.start_round().is_empty());
        instance.end_probe();
        assert_eq!(monitor.start_round().len(), 1);
    }

    #[tokio::test]
    async fn test_background_loop_stops_on_cancel() {
        let server = MockServer::start().await;
        Mock::given(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        let shutdown = CancellationToken::new();
        let handle = Arc::new(monitor(&registry)).spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            registry.list_instances("orders")[0].status(),
            InstanceStatus::Healthy
        );

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_aborts_running_probes() {
        let server = MockServer::start().await;
        Mock::given(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(1)))
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        let config = HealthMonitorConfig {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
            ..monitor_config()
        };
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            UpstreamClients::new().unwrap(),
            config,
        );
        let shutdown = CancellationToken::new();
        let handle = Arc::new(monitor).spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let instance = Arc::clone(&registry.list_instances("orders")[0]);
        assert!(!instance.begin_probe());

        let stopping = Instant::now();
        shutdown.cancel();
        handle.await.unwrap();
        assert!(stopping.elapsed() < Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(instance.status(), InstanceStatus::Unknown);
        assert!(instance.begin_probe());
    }

    #[test]
    fn test_report_aggregation() {
        let registry = ServiceRegistry::new(CircuitBreakerConfig::default());
        let orders = registry.register(Arc::new(ServiceDescriptor::new(
            "orders",
            Url::parse("http://orders:1").unwrap(),
            "/api/orders",
        )));
        registry.register(Arc::new(ServiceDescriptor::new(
            "users",
            Url::parse("http://users:1").unwrap(),
            "/api/users",
        )));

        let report = HealthReport::from_registry(&registry, Duration::from_secs(3));
        assert_eq!(report.status, GatewayStatus::Unhealthy);
        assert_eq!(report.uptime, 3);

        orders.record_probe(ProbeReport {
            status: InstanceStatus::Healthy,
            latency: Duration::from_millis(1),
            uptime: None,
            version: None,
        });
        let report = HealthReport::from_registry(&registry, Duration::from_secs(3));
        assert_eq!(report.status, GatewayStatus::Degraded);
        assert_eq!(report.services["orders"].healthy, 1);
        assert_eq!(report.services["users"].total, 1);
    }
}
