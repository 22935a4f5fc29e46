//! # HTTP Server Module
//!
//! The axum application in front of the dispatcher.
//!
//! ## Endpoints
//! - `GET /health`: aggregate gateway status and per-service healthy/total counts
//!   (503 when no service has a healthy instance)
//! - `GET /services`: every instance with its status, breaker state and metrics
//! - `GET /metrics`: Prometheus text format (404 when no recorder is installed)
//! - everything else: proxied through the [`RequestDispatcher`]
//!
//! ## Rust Concepts Used
//!
//! - `State<AppState>` hands each handler a cheap clone of shared `Arc`s
//! - `ConnectInfo<SocketAddr>` is read from request extensions when the listener
//!   provides it, so the router also works in-process under test
//! - `CancellationToken` drives graceful shutdown

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::IncomingRequest;
use crate::discovery::{InstanceSnapshot, ServiceRegistry};
use crate::gateway::dispatcher::RequestDispatcher;
use crate::observability::health::{GatewayStatus, HealthReport};
use crate::observability::metrics::record_request;

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<RequestDispatcher>,
    pub registry: Arc<ServiceRegistry>,
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
    pub max_body_size: usize,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<RequestDispatcher>,
        registry: Arc<ServiceRegistry>,
        metrics: Option<PrometheusHandle>,
        max_body_size: usize,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            metrics,
            started_at: Instant::now(),
            max_body_size,
        }
    }
}

/// Build the gateway router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(gateway_health))
        .route("/services", get(list_services))
        .route("/metrics", get(render_metrics))
        .fallback(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> GatewayResult<()> {
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "Gateway listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))?;

    info!("Gateway server stopped");
    Ok(())
}

/// Proxy handler for every path not claimed by the gateway itself
async fn proxy(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let body = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let incoming = IncomingRequest::new(
                parts.method,
                parts.uri,
                parts.headers,
                Default::default(),
                remote_addr,
            );
            warn!(correlation_id = %incoming.correlation_id, error = %e, "Failed to read request body");
            return GatewayError::InvalidRequest {
                message: format!("Failed to read request body: {}", e),
            }
            .to_response(&incoming.correlation_id);
        }
    };

    let incoming = IncomingRequest::new(parts.method, parts.uri, parts.headers, body, remote_addr);
    let service = state
        .dispatcher
        .service_for_path(incoming.path())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = match state.dispatcher.dispatch(&incoming).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            info!(
                correlation_id = %incoming.correlation_id,
                path = %incoming.path(),
                error_type = e.error_type(),
                error = %e,
                "Request rejected"
            );
            e.to_response(&incoming.correlation_id)
        }
    };

    record_request(
        incoming.method.as_str(),
        &service,
        response.status().as_u16(),
        incoming.received_at.elapsed(),
    );
    response
}

async fn gateway_health(State(state): State<AppState>) -> impl IntoResponse {
    let report = HealthReport::from_registry(&state.registry, state.started_at.elapsed());
    let status = match report.status {
        GatewayStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report))
}

async fn list_services(State(state): State<AppState>) -> impl IntoResponse {
    let services: BTreeMap<String, serde_json::Value> = state
        .registry
        .all_services()
        .into_iter()
        .map(|(name, instances)| {
            let snapshots: Vec<InstanceSnapshot> =
                instances.iter().map(|instance| instance.snapshot()).collect();
            let selection = state.dispatcher.selector().stats(&name);
            (
                name,
                json!({
                    "instances": snapshots,
                    "selection": selection,
                }),
            )
        })
        .collect();

    let cache = state.dispatcher.cache().map(|cache| cache.stats());
    Json(json!({
        "services": services,
        "cache": cache,
        "rate_limiting": state.dispatcher.rate_limiter().get_metrics(),
    }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4")
            .body(Body::from(handle.render()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        None => (StatusCode::NOT_FOUND, "metrics exporter disabled").into_response(),
    }
}
