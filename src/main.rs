//! # Service Gateway - Main Entry Point
//!
//! Startup sequence:
//!
//! 1. Load and validate the YAML configuration (`GATEWAY_CONFIG_PATH`, default
//!    `config/gateway.yaml`) with environment overrides applied
//! 2. Initialize structured logging and, when enabled, the Prometheus recorder
//! 3. Build the registry, breakers, balancer, dispatcher and cache
//! 4. Probe every instance once so traffic is routed only to known-healthy instances
//! 5. Spawn the health monitor and cache sweeper, then serve until SIGINT/SIGTERM
//!
//! `anyhow` is used only here, at the binary edge; the library returns
//! `GatewayError`.

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use service_gateway::gateway::serve;
use service_gateway::observability::{init_tracing, install_recorder};
use service_gateway::{GatewayConfig, GatewayRuntime};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = GatewayConfig::load_from_file(&config_path)
        .await
        .with_context(|| format!("loading configuration from {}", config_path))?;

    init_tracing(&config.logging).context("initializing logging")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path,
        "Starting service gateway"
    );

    let metrics = if config.observability.metrics_enabled {
        Some(install_recorder().context("installing metrics recorder")?)
    } else {
        None
    };

    let runtime = GatewayRuntime::from_config(config).context("building gateway components")?;
    runtime.initial_probe().await;

    let shutdown = CancellationToken::new();
    let background = runtime.spawn_background(shutdown.clone());

    let bind_address = runtime.config().server.bind_address.clone();
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {}", bind_address))?;

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("Shutdown signal received, draining connections");
            shutdown.cancel();
        }
    });

    let result = serve(listener, runtime.router(metrics), shutdown.clone()).await;

    shutdown.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    result.context("serving gateway")?;
    info!("Service gateway shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on unix
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
