//! CRI resource manager
//!
//! Runs on each node between the kubelet and the container runtime,
//! relaying runtime calls and applying configuration pushed by the
//! cluster agent.

use anyhow::{bail, Context, Result};
use resmgr_lib::{
    health::HealthRegistry,
    observability::{ResmgrMetrics, StructuredLogger},
    AgentInterface, ResourceManager,
};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let settings = config::Settings::load()?;
    if settings.node_name.is_empty() {
        bail!("node name not set, export NODE_NAME or RESMGR_NODE_NAME");
    }
    info!(node_name = %settings.node_name, policy = %settings.policy, "Resource manager configured");

    let health_registry = HealthRegistry::new();
    // register the metrics before anything can scrape them
    ResmgrMetrics::new();
    let logger = StructuredLogger::new(&settings.node_name);

    let agent = AgentInterface::connect(&settings.agent_socket, &settings.node_name)
        .await
        .context("failed to set up cluster agent interface")?;

    let resmgr = ResourceManager::new(settings.resmgr_options(), agent, health_registry.clone())
        .await
        .context("failed to create resource manager")?;
    resmgr
        .start()
        .await
        .context("failed to start resource manager")?;

    let app_state = Arc::new(api::AppState::new(health_registry, resmgr.clone()));
    let api_handle = tokio::spawn(api::serve(settings.api_port, app_state));

    let mut terminate = signal(SignalKind::terminate())?;
    let reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT received",
        _ = terminate.recv() => "SIGTERM received",
    };
    info!(reason, "Shutting down");

    resmgr.stop().await;
    api_handle.abort();
    if let Ok(Err(e)) = api_handle.await {
        warn!(error = %e, "API server failed");
    }
    logger.log_shutdown(reason);

    Ok(())
}
