// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0

//! # Fleet Control
//!
//! The `fleet-control` binary wires the control plane together: it
//! loads configuration, connects to the backend, starts the sync and
//! push loops and serves the dashboard API until interrupted.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use fleet_control_core::application::{
    AgentRegistry, CommandDispatcher, MetricsAggregator, StatusSyncEngine,
};
use fleet_control_core::application::logs::LogStreamController;
use fleet_control_core::infrastructure::client::{ControlPlaneClient, HttpControlPlaneClient};
use fleet_control_core::infrastructure::config::ControlPlaneConfig;
use fleet_control_core::infrastructure::event_bus::EventBus;
use fleet_control_core::infrastructure::push::PushListener;
use fleet_control_core::presentation::{app, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("info")?;

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FLEET_CONFIG_PATH").ok())
        .unwrap_or_else(|| "fleet-control.yaml".to_string());
    let config = ControlPlaneConfig::load(&PathBuf::from(&config_path))?;
    info!(config = %config_path, backend = %config.backend_url, "starting fleet control plane");

    if let Some(port) = config.metrics_port {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([127, 0, 0, 1], port))
            .install()
            .context("installing Prometheus exporter")?;
        info!(port, "metrics endpoint enabled");
    }

    let bus = EventBus::new(config.event_bus_capacity);
    let registry = Arc::new(AgentRegistry::new(bus));
    let client: Arc<dyn ControlPlaneClient> =
        Arc::new(HttpControlPlaneClient::new(config.backend_url.clone()));
    let logs = Arc::new(LogStreamController::new(
        config.log_max_entries,
        config.log_max_age(),
    ));
    let aggregator = Arc::new(MetricsAggregator::new(registry.clone()));
    let dispatcher = Arc::new(CommandDispatcher::new(registry.clone(), client.clone()));
    let sync = Arc::new(StatusSyncEngine::new(
        registry.clone(),
        client.clone(),
        config.poll_interval(),
    ));

    let cancel = CancellationToken::new();

    if config.push_enabled {
        let listener = PushListener::new(&config.backend_url, sync.hint_sender());
        tokio::spawn(listener.run(cancel.clone()));
    }
    tokio::spawn(aggregator.clone().run(cancel.clone()));

    // Populate the registry before accepting requests; a failed first
    // poll just means the views start empty and flagged degraded.
    if let Err(e) = sync.poll_once().await {
        tracing::warn!(error = %e, "initial hierarchy fetch failed; will retry");
    }
    tokio::spawn(sync.clone().run(cancel.clone()));

    let state = Arc::new(AppState {
        registry,
        aggregator,
        logs,
        dispatcher,
        client,
        poll_interval: chrono::Duration::seconds(config.poll_interval_secs as i64),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding dashboard API to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "dashboard API listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        })
        .await
        .context("dashboard API server failed")?;

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("creating log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}
