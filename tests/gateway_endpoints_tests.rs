//! # Gateway Endpoint Tests
//!
//! The endpoints the gateway answers itself: `/health`, `/services` and
//! `/metrics`, plus connection-level forwarding headers.

mod common;

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::StatusCode;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::Value;
use tower::ServiceExt;
use wiremock::matchers::{header, path};
use wiremock::{Mock, ResponseTemplate};

use common::{backend, runtime, test_server};

fn two_services(orders: &str, catalog: &str) -> String {
    format!(
        r#"
services:
  - name: orders
    base_address: {}
    path_prefix: /api/orders
  - name: catalog
    base_address: {}
    path_prefix: /api/catalog
"#,
        orders, catalog
    )
}

/// Every service healthy gives an overall healthy report
#[tokio::test]
async fn test_health_reports_healthy_services() {
    let orders = backend(200).await;
    let catalog = backend(200).await;
    let gateway = runtime(&two_services(&orders.uri(), &catalog.uri()));
    gateway.initial_probe().await;
    let server = test_server(&gateway);

    let response = server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["services"]["orders"]["healthy"], 1);
    assert_eq!(body["services"]["orders"]["total"], 1);
    assert!(body["version"].as_str().is_some());
}

/// One service down degrades the report without failing it
#[tokio::test]
async fn test_health_reports_degraded_when_a_service_is_down() {
    let orders = backend(200).await;
    let catalog = backend(503).await;
    let gateway = runtime(&two_services(&orders.uri(), &catalog.uri()));
    gateway.initial_probe().await;
    let server = test_server(&gateway);

    let response = server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["services"]["catalog"]["healthy"], 0);
}

/// No healthy service at all answers 503
#[tokio::test]
async fn test_health_reports_unhealthy_with_503() {
    let orders = backend(500).await;
    let catalog = backend(500).await;
    let gateway = runtime(&two_services(&orders.uri(), &catalog.uri()));
    gateway.initial_probe().await;
    let server = test_server(&gateway);

    let response = server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["status"], "unhealthy");
}

/// /services lists every instance with health, breaker and metrics
#[tokio::test]
async fn test_services_lists_instances_and_breaker_state() {
    let orders = backend(200).await;
    let catalog = backend(500).await;
    let gateway = runtime(&two_services(&orders.uri(), &catalog.uri()));
    gateway.initial_probe().await;
    let server = test_server(&gateway);

    let response = server.get("/services").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body: Value = response.json();
    let orders_instances = body["services"]["orders"]["instances"].as_array().unwrap();
    assert_eq!(orders_instances.len(), 1);
    assert_eq!(orders_instances[0]["id"], "orders-0");
    assert_eq!(orders_instances[0]["health"]["status"], "healthy");
    assert_eq!(orders_instances[0]["breaker"]["state"], "CLOSED");

    let catalog_instances = body["services"]["catalog"]["instances"].as_array().unwrap();
    assert_eq!(catalog_instances[0]["health"]["status"], "unhealthy");
    assert_eq!(catalog_instances[0]["breaker"]["consecutive_failures"], 1);

    assert!(body["cache"].is_object());
}

/// Without an installed recorder /metrics is not served
#[tokio::test]
async fn test_metrics_disabled_returns_404() {
    let orders = backend(200).await;
    let catalog = backend(200).await;
    let gateway = runtime(&two_services(&orders.uri(), &catalog.uri()));
    let server = test_server(&gateway);

    let response = server.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

/// With a recorder handle /metrics renders the Prometheus text format
#[tokio::test]
async fn test_metrics_enabled_renders_text() {
    let orders = backend(200).await;
    let catalog = backend(200).await;
    let gateway = runtime(&two_services(&orders.uri(), &catalog.uri()));
    let handle = PrometheusBuilder::new().build_recorder().handle();
    let server = axum_test::TestServer::new(gateway.router(Some(handle))).unwrap();

    let response = server.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().starts_with("text/plain"));
}

/// The client address from the listener is forwarded as X-Forwarded-For
#[tokio::test]
async fn test_client_address_is_forwarded() {
    let orders = backend(200).await;
    let catalog = backend(200).await;
    Mock::given(path("/api/orders/1"))
        .and(header("x-forwarded-for", "10.9.8.7"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&orders)
        .await;

    let gateway = runtime(&two_services(&orders.uri(), &catalog.uri()));
    gateway.initial_probe().await;

    let client: SocketAddr = "10.9.8.7:55000".parse().unwrap();
    let mut request = http::Request::builder()
        .uri("/api/orders/1")
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(ConnectInfo(client));

    let response = gateway.router(None).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-correlation-id").is_some());
    assert_eq!(response.headers().get("x-served-by").unwrap(), "orders-0");
}
