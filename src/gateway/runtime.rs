//! Wiring of the gateway components from a validated configuration.
//!
//! The registry is created once here and passed to the health monitor, the
//! instance selector and the HTTP state, so every component sees the same
//! instances and breakers.

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::config::GatewayConfig;
use crate::core::connection_pool::UpstreamClients;
use crate::core::error::GatewayResult;
use crate::discovery::ServiceRegistry;
use crate::gateway::dispatcher::RequestDispatcher;
use crate::gateway::server::{build_router, AppState};
use crate::observability::health::HealthMonitor;

const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const RATE_LIMIT_IDLE: Duration = Duration::from_secs(600);

pub struct GatewayRuntime {
    config: GatewayConfig,
    registry: Arc<ServiceRegistry>,
    dispatcher: Arc<RequestDispatcher>,
    health_monitor: Arc<HealthMonitor>,
}

impl GatewayRuntime {
    /// Build registry, breakers, balancer, dispatcher, cache and health monitor
    pub fn from_config(config: GatewayConfig) -> GatewayResult<Self> {
        let clients = UpstreamClients::new()?;
        let registry = Arc::new(ServiceRegistry::from_descriptors(
            config.services.clone(),
            config.circuit_breaker.clone(),
        ));
        let dispatcher = Arc::new(RequestDispatcher::from_config(
            &config,
            Arc::clone(&registry),
            clients.clone(),
        )?);
        let health_monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            clients,
            config.health.clone(),
        ));

        info!(
            services = config.services.len(),
            instances = registry.all_instances().len(),
            routes = dispatcher.routes().routes().len(),
            "Gateway components initialized"
        );

        Ok(Self {
            config,
            registry,
            dispatcher,
            health_monitor,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health_monitor
    }

    /// Probe every instance once and wait for the results
    pub async fn initial_probe(&self) {
        self.health_monitor.run_once().await;
        info!("Initial health probe round complete");
    }

    /// Start the health monitor, the cache sweeper and rate limit bucket cleanup
    pub fn spawn_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            Arc::clone(&self.health_monitor).spawn(shutdown.clone()),
            self.dispatcher.rate_limiter().spawn_cleanup(
                RATE_LIMIT_CLEANUP_INTERVAL,
                RATE_LIMIT_IDLE,
                shutdown.clone(),
            ),
        ];
        if let Some(cache) = self.dispatcher.cache() {
            handles.push(cache.spawn_sweeper(self.config.cache.sweep_interval, shutdown));
        }
        handles
    }

    /// axum router over this runtime's state
    pub fn router(&self, metrics: Option<PrometheusHandle>) -> Router {
        build_router(AppState::new(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.registry),
            metrics,
            self.config.server.max_body_size,
        ))
    }
}
