// src/config.rs

//! Manages probe configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

/// Settings of the capture workers and the streams they run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    /// The MySQL server port. Packets addressed to it are requests.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of dispatcher workers. Connections are partitioned among them.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Depth of each connection's packet queue.
    #[serde(default = "default_input_queue_length")]
    pub input_queue_length: usize,
    /// Depth of each worker's packet queue.
    #[serde(default = "default_worker_queue_length")]
    pub worker_queue_length: usize,
    /// Connections silent for longer than this are closed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// How often each worker looks for idle connections.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_port() -> u16 {
    3306
}
fn default_workers() -> usize {
    1
}
fn default_input_queue_length() -> usize {
    100
}
fn default_worker_queue_length() -> usize {
    4096
}
fn default_idle_timeout_secs() -> u64 {
    300 // 5 minutes
}
fn default_sweep_interval_secs() -> u64 {
    10
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            workers: default_workers(),
            input_queue_length: default_input_queue_length(),
            worker_queue_length: default_worker_queue_length(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl ProbeConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8667
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// A known client address → database mapping used to seed the resolver.
/// `client` is a socket address: `10.0.0.7:51234` or `[fd00::7]:51234`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DbNameSeed {
    pub client: String,
    pub db: String,
}

impl DbNameSeed {
    /// The client address in the form streams report it, so `[fd00:0::7]:1`
    /// and `[fd00::7]:1` name the same connection.
    pub fn client_key(&self) -> String {
        match self.client.parse::<SocketAddr>() {
            Ok(addr) => addr.to_string(),
            Err(_) => self.client.clone(),
        }
    }
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    probe: ProbeConfig,
    #[serde(default)]
    metrics: MetricsConfig,
    #[serde(default)]
    db_names: Vec<DbNameSeed>,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Represents the final, validated probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub log_level: String,
    pub probe: ProbeConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub db_names: Vec<DbNameSeed>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            probe: ProbeConfig::default(),
            metrics: MetricsConfig::default(),
            db_names: Vec::new(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config in '{path}'"))
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw_config: RawConfig =
            toml::from_str(contents).context("Failed to parse TOML configuration")?;

        let config = Config {
            log_level: raw_config.log_level,
            probe: raw_config.probe,
            metrics: raw_config.metrics,
            db_names: raw_config.db_names,
        };

        config.validate()?;
        Ok(config)
    }

    /// Replaces the server port and re-validates, since the new port can
    /// clash with `metrics.port`. The config is left unchanged on error.
    pub fn override_probe_port(&mut self, port: u16) -> Result<()> {
        let previous = std::mem::replace(&mut self.probe.port, port);
        if let Err(e) = self.validate() {
            self.probe.port = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        let probe = &self.probe;
        if probe.port == 0 {
            return Err(anyhow!("probe.port cannot be 0"));
        }
        if probe.workers == 0 {
            return Err(anyhow!("probe.workers cannot be 0"));
        }
        if probe.input_queue_length == 0 {
            return Err(anyhow!("probe.input_queue_length cannot be 0"));
        }
        if probe.worker_queue_length == 0 {
            return Err(anyhow!("probe.worker_queue_length cannot be 0"));
        }
        if probe.idle_timeout_secs == 0 {
            return Err(anyhow!("probe.idle_timeout_secs cannot be 0"));
        }
        if probe.sweep_interval_secs == 0 {
            return Err(anyhow!("probe.sweep_interval_secs cannot be 0"));
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == probe.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as probe.port ({})",
                    probe.port
                ));
            }
        }

        for (i, seed) in self.db_names.iter().enumerate() {
            if seed.client.trim().is_empty() {
                return Err(anyhow!("db_names entry #{}: client cannot be empty", i + 1));
            }
            if seed.client.parse::<SocketAddr>().is_err() {
                return Err(anyhow!(
                    "db_names entry #{}: client '{}' is not an ip:port address (IPv6 as [ip]:port)",
                    i + 1,
                    seed.client
                ));
            }
            if seed.db.trim().is_empty() {
                return Err(anyhow!("db_names entry #{}: db cannot be empty", i + 1));
            }
        }

        Ok(())
    }
}
