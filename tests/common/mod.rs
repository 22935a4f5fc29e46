//! Shared fixtures for the integration tests: wiremock backends and gateway builders.

#![allow(dead_code)]

use std::time::Duration;

use axum_test::TestServer;
use service_gateway::core::circuit_breaker::Outcome;
use service_gateway::discovery::{InstanceStatus, ProbeReport, ServiceInstance};
use service_gateway::{GatewayConfig, GatewayRuntime};
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Start a backend whose `/health` answers with `health_status`
pub async fn backend(health_status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(path("/health"))
        .respond_with(ResponseTemplate::new(health_status))
        .mount(&server)
        .await;
    server
}

/// Address that refuses connections
pub fn dead_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// Requests a backend received outside its health endpoint
pub async fn business_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() != "/health")
        .count()
}

pub fn runtime(yaml: &str) -> GatewayRuntime {
    let config = GatewayConfig::from_yaml_str(yaml).unwrap();
    config.validate().unwrap();
    GatewayRuntime::from_config(config).unwrap()
}

pub fn test_server(runtime: &GatewayRuntime) -> TestServer {
    TestServer::new(runtime.router(None)).unwrap()
}

/// Mark an instance healthy without probing it
pub fn mark_healthy(instance: &ServiceInstance, latency_ms: u64) {
    instance.record_probe(ProbeReport {
        status: InstanceStatus::Healthy,
        latency: Duration::from_millis(latency_ms),
        uptime: None,
        version: None,
    });
}

pub fn report_failures(instance: &ServiceInstance, count: usize) {
    for _ in 0..count {
        instance.breaker().report(Outcome::Failure);
    }
}
