// src/server/probe.rs

//! The worker pool that spreads captured packets over several dispatchers.
//!
//! Every worker owns one [`Assembly`]. Packets are routed by a hash that is
//! the same for both directions of a connection, so a connection never spans
//! two workers and the workers share nothing but the output channel and the
//! resolver.

use crate::config::ProbeConfig;
use crate::connection::Assembly;
use crate::core::ProbeError;
use crate::core::flow::{CapturedPacket, IsRequest, dst_port_classifier};
use crate::core::message::Message;
use crate::core::resolver::DbNameResolver;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// A single dispatcher task and the queue feeding it.
struct Worker {
    assembly: Assembly,
    rx: mpsc::Receiver<CapturedPacket>,
    idle_timeout: chrono::Duration,
    sweep_interval: Duration,
    /// Latest capture timestamp seen; eviction runs on capture time.
    latest: Option<DateTime<Utc>>,
}

impl Worker {
    async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("[{}] worker started", self.assembly.name());
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    let closed = self.assembly.close_all();
                    info!("[{}] shutting down, closed {} streams", self.assembly.name(), closed);
                    return;
                }
                packet = self.rx.recv() => {
                    let Some(packet) = packet else {
                        let released = self.assembly.release_all();
                        info!("[{}] input finished, released {} streams", self.assembly.name(), released);
                        return;
                    };
                    if self.latest.is_none_or(|latest| packet.timestamp > latest) {
                        self.latest = Some(packet.timestamp);
                    }
                    self.assembly.assemble(packet).await;
                }
                _ = interval.tick() => {
                    self.sweep();
                }
            }
        }
    }

    fn sweep(&mut self) {
        let Some(latest) = self.latest else {
            return;
        };
        let Some(cutoff) = latest.checked_sub_signed(self.idle_timeout) else {
            return;
        };
        let closed = self.assembly.close_older_than(cutoff);
        debug!(
            "[{}] sweep at {}: {} closed, {} active",
            self.assembly.name(),
            cutoff,
            closed,
            self.assembly.len()
        );
    }
}

/// A running pool of dispatcher workers.
pub struct Probe {
    senders: Vec<mpsc::Sender<CapturedPacket>>,
    shutdown_tx: broadcast::Sender<()>,
    workers: JoinSet<()>,
}

impl Probe {
    /// Starts `config.workers` workers classifying packets by the configured
    /// server port.
    pub fn start(
        config: &ProbeConfig,
        out: mpsc::UnboundedSender<Message>,
        resolver: Option<Arc<dyn DbNameResolver>>,
    ) -> Self {
        Self::start_with_classifier(config, dst_port_classifier(config.port), out, resolver)
    }

    /// Starts the pool with a caller-supplied direction classifier.
    pub fn start_with_classifier(
        config: &ProbeConfig,
        is_request: IsRequest,
        out: mpsc::UnboundedSender<Message>,
        resolver: Option<Arc<dyn DbNameResolver>>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut workers = JoinSet::new();
        let mut senders = Vec::with_capacity(config.workers);

        let idle_timeout = chrono::Duration::from_std(config.idle_timeout())
            .unwrap_or(chrono::Duration::MAX);

        for id in 0..config.workers.max(1) {
            let (tx, rx) = mpsc::channel(config.worker_queue_length.max(1));
            let mut assembly = Assembly::new(format!("worker-{id}"), is_request.clone(), out.clone())
                .with_input_queue_length(config.input_queue_length);
            if let Some(resolver) = &resolver {
                assembly = assembly.with_resolver(resolver.clone());
            }

            let worker = Worker {
                assembly,
                rx,
                idle_timeout,
                sweep_interval: config.sweep_interval(),
                latest: None,
            };
            let shutdown_rx = shutdown_tx.subscribe();
            workers.spawn(worker.run(shutdown_rx));
            senders.push(tx);
        }

        info!("Probe started with {} workers on port {}", senders.len(), config.port);
        Self {
            senders,
            shutdown_tx,
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Queues a packet on the worker that owns its connection, waiting while
    /// that worker's queue is full.
    pub async fn dispatch(&self, packet: CapturedPacket) -> Result<(), ProbeError> {
        let index = (packet.key().symmetric_hash() % self.senders.len() as u64) as usize;
        self.senders[index]
            .send(packet)
            .await
            .map_err(|_| ProbeError::ChannelClosed)
    }

    /// Stops accepting packets and waits for the workers to finish the ones
    /// already queued. Streams are released rather than closed, so they
    /// process their own queues before exiting.
    pub async fn drain(mut self) {
        self.senders.clear();
        self.join().await;
    }

    /// Signals every worker to stop now. Queued packets are dropped and all
    /// streams closed.
    pub async fn shutdown(mut self) {
        // Workers that already exited have no receiver left.
        let _ = self.shutdown_tx.send(());
        self.senders.clear();
        self.join().await;
    }

    async fn join(&mut self) {
        while let Some(res) = self.workers.join_next().await {
            if let Err(e) = res {
                error!("Probe worker panicked: {e:?}");
            }
        }
        info!("Probe stopped.");
    }
}
