// src/server/spawner.rs

//! Spawns the probe's long-running background tasks.

use super::metrics_server;
use crate::config::Config;
use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;

/// Spawns all background tasks into the provided JoinSet.
pub fn spawn_all(
    config: &Config,
    shutdown_tx: &broadcast::Sender<()>,
    background_tasks: &mut JoinSet<Result<()>>,
) {
    // --- Metrics Server ---
    if config.metrics.enabled {
        let port = config.metrics.port;
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(port, shutdown_rx_metrics).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }
}
