//! # Configuration Loading Tests
//!
//! YAML files on disk, environment overrides and validation failures.

use std::time::Duration;

use service_gateway::core::config::{BalancingStrategy, LogFormat};
use service_gateway::{GatewayConfig, GatewayError, GatewayRuntime};
use tokio_test::{assert_err, assert_ok};

const CONFIG: &str = r#"
server:
  bind_address: 127.0.0.1:0
health:
  interval: 2s
  timeout: 300ms
  degraded_latency: 250ms
load_balancing:
  strategy: round_robin
cache:
  default_ttl: 10s
  max_entries: 100
logging:
  level: debug
  format: pretty
services:
  - name: inventory
    base_address: http://inventory-0:4000
    replicas: [http://inventory-1:4000]
    path_prefix: /api/inventory
    health_path: /ready
    retries: 1
  - name: payments
    base_address: https://payments:4443/v2
    path_prefix: /api/payments
    protocol_version: http2
"#;

async fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.yaml");
    tokio::fs::write(&path, content).await.unwrap();
    (dir, path)
}

/// A file on disk loads with nested sections and durations parsed
#[tokio::test]
async fn test_load_config_from_file() {
    let (_dir, path) = write_config(CONFIG).await;
    let config = assert_ok!(GatewayConfig::load_from_file(&path).await);

    assert_eq!(config.health.interval, Duration::from_secs(2));
    assert_eq!(config.health.degraded_latency, Some(Duration::from_millis(250)));
    assert_eq!(config.load_balancing.strategy, BalancingStrategy::RoundRobin);
    assert_eq!(config.cache.max_entries, 100);
    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert_eq!(config.service("inventory").unwrap().health_path, "/ready");
    assert_eq!(config.effective_routes().len(), 2);
}

/// Environment variables override file values
#[tokio::test]
async fn test_env_overrides_apply_on_load() {
    let (_dir, path) = write_config(CONFIG).await;
    std::env::set_var("GATEWAY_BIND_ADDRESS", "127.0.0.1:9443");
    std::env::set_var("GATEWAY_JWT_SECRET", "from-env");

    let config = GatewayConfig::load_from_file(&path).await;

    std::env::remove_var("GATEWAY_BIND_ADDRESS");
    std::env::remove_var("GATEWAY_JWT_SECRET");

    let config = assert_ok!(config);
    assert_eq!(config.server.bind_address, "127.0.0.1:9443");
    assert_eq!(config.auth.jwt_secret.as_deref(), Some("from-env"));
}

#[tokio::test]
async fn test_missing_file_is_a_configuration_error() {
    let err = assert_err!(GatewayConfig::load_from_file("/nonexistent/gateway.yaml").await);
    assert!(matches!(err, GatewayError::Configuration { .. }));
}

#[tokio::test]
async fn test_invalid_yaml_is_rejected() {
    let (_dir, path) = write_config("services: [this is: not valid").await;
    assert_err!(GatewayConfig::load_from_file(&path).await);
}

#[tokio::test]
async fn test_non_http_address_is_rejected() {
    let content = CONFIG.replace("http://inventory-0:4000", "ftp://inventory-0:4000");
    let (_dir, path) = write_config(&content).await;

    let err = assert_err!(GatewayConfig::load_from_file(&path).await);
    assert!(err.to_string().contains("must use http or https"));
}

/// A loaded configuration wires one instance per address with stable ids
#[tokio::test]
async fn test_runtime_builds_instances_from_config() {
    let (_dir, path) = write_config(CONFIG).await;
    let config = GatewayConfig::load_from_file(&path).await.unwrap();
    let runtime = GatewayRuntime::from_config(config).unwrap();

    let inventory = runtime.registry().list_instances("inventory");
    let ids: Vec<&str> = inventory.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["inventory-0", "inventory-1"]);

    let payments = runtime.registry().list_instances("payments");
    assert_eq!(
        payments[0].target_url("/charges", Some("id=1")).as_str(),
        "https://payments:4443/v2/charges?id=1"
    );
    assert_eq!(runtime.dispatcher().selector().registry().service_names().len(), 2);
}

/// The shipped sample configuration stays loadable
#[tokio::test]
async fn test_bundled_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/gateway.yaml");
    let config = assert_ok!(GatewayConfig::load_from_file(&path).await);
    assert_eq!(config.services.len(), 3);
    assert!(config.effective_routes()[2].cacheable);
}
