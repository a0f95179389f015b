// src/server/mod.rs

//! Wires the probe together: capture replay in, worker pool in the middle,
//! JSON lines out.

use crate::config::Config;
use crate::core::flow::CapturedPacket;
use crate::core::resolver::{ConnectionWatcher, DbNameResolver};
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

pub mod capture;
pub mod metrics_server;
pub mod output;
pub mod probe;
mod spawner;

pub use capture::PcapReplay;
pub use probe::Probe;

/// How the packet loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    /// The capture was read to the end.
    Finished,
    /// A signal arrived first.
    Interrupted,
}

/// Handle used to swap the log filter while running.
pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>;

/// Replays `pcap_path` through the probe, printing records to stdout.
///
/// `config_path` is re-read on SIGHUP to pick up a changed `log_level`.
pub async fn run(
    config: Config,
    config_path: &str,
    pcap_path: &str,
    log_reload_handle: LogReloadHandle,
) -> Result<()> {
    let mut replay = PcapReplay::open(pcap_path)
        .with_context(|| format!("Failed to open capture '{pcap_path}'"))?;

    let watcher = Arc::new(ConnectionWatcher::with_entries(
        config
            .db_names
            .iter()
            .map(|seed| (seed.client_key(), seed.db.clone())),
    ));
    if !watcher.is_empty() {
        info!("Seeded database resolver with {} clients.", watcher.len());
    }

    // 1. Background tasks.
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut background_tasks = JoinSet::new();
    spawner::spawn_all(&config, &shutdown_tx, &mut background_tasks);

    // 2. Output sink and worker pool.
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(output::write_json_lines(out_rx, tokio::io::stdout()));
    let resolver: Arc<dyn DbNameResolver> = watcher;
    let probe = Probe::start(&config.probe, out_tx, Some(resolver));

    // 3. The capture is read on a blocking thread and fed through a channel.
    let (packet_tx, mut packet_rx) = mpsc::channel(config.probe.worker_queue_length);
    let reader = tokio::task::spawn_blocking(move || {
        let mut count = 0u64;
        for packet in replay.by_ref() {
            let packet = packet?;
            if packet_tx.blocking_send(packet).is_err() {
                break;
            }
            count += 1;
        }
        Ok::<(u64, u64), crate::core::ProbeError>((count, replay.frames()))
    });

    let completion = match packet_loop(&probe, &mut packet_rx, config_path, &log_reload_handle).await {
        Ok(completion) => completion,
        Err(e) => {
            probe.shutdown().await;
            return Err(e);
        }
    };
    drop(packet_rx);

    // 4. Shutdown.
    match completion {
        Completion::Finished => probe.drain().await,
        Completion::Interrupted => probe.shutdown().await,
    }
    let _ = shutdown_tx.send(());

    match reader.await {
        Ok(Ok((count, frames))) => info!(
            "Replayed {} TCP packets out of {} frames from '{}'.",
            count, frames, pcap_path
        ),
        Ok(Err(e)) => error!("Capture replay failed: {}", e),
        Err(e) => error!("Capture reader panicked: {e:?}"),
    }

    writer
        .await
        .map_err(|e| anyhow!("Output task panicked: {e:?}"))??;

    while let Some(res) = background_tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Background task failed: {}", e),
            Err(e) => error!("Background task panicked: {e:?}"),
        }
    }

    info!("Shutdown complete.");
    Ok(())
}

/// Moves packets from the capture to the probe until the capture ends or a
/// termination signal arrives.
async fn packet_loop(
    probe: &Probe,
    packet_rx: &mut mpsc::Receiver<CapturedPacket>,
    config_path: &str,
    log_reload_handle: &LogReloadHandle,
) -> Result<Completion> {
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                return Ok(Completion::Interrupted);
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                return Ok(Completion::Interrupted);
            }

            _ = sighup.recv() => {
                reload_log_level(config_path, log_reload_handle);
            }

            packet = packet_rx.recv() => {
                let Some(packet) = packet else {
                    return Ok(Completion::Finished);
                };
                probe
                    .dispatch(packet)
                    .await
                    .context("Probe worker stopped unexpectedly")?;
            }
        }
    }
}

/// Re-reads the config file and applies its `log_level`. `RUST_LOG`, when
/// set, keeps precedence.
fn reload_log_level(config_path: &str, log_reload_handle: &LogReloadHandle) {
    if std::env::var("RUST_LOG").is_ok() {
        info!("SIGHUP received, but RUST_LOG is set; keeping the current log filter.");
        return;
    }
    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!("SIGHUP received, but the config could not be reloaded: {:#}", e);
            return;
        }
    };
    match EnvFilter::try_new(&config.log_level) {
        Ok(filter) => match log_reload_handle.reload(filter) {
            Ok(()) => info!("Log level set to '{}'.", config.log_level),
            Err(e) => warn!("Failed to apply log level '{}': {}", config.log_level, e),
        },
        Err(e) => warn!("Invalid log level '{}': {}", config.log_level, e),
    }
}
