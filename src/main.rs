// src/main.rs

//! The main entry point for the mysqlprobe application.

use anyhow::Result;
use mysqlprobe::config::Config;
use mysqlprobe::server;
use std::env;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

const USAGE: &str = "Usage: mysqlprobe [--config probe.toml] --pcap capture.pcap [--port N]";

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

/// Returns the value following `flag`. Exits if the flag is given without a value.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let index = args.iter().position(|arg| arg == flag)?;
    match args.get(index + 1) {
        Some(value) => Some(value.as_str()),
        None => {
            eprintln!("{flag} flag requires a value");
            std::process::exit(1);
        }
    }
}

async fn run_app() -> Result<()> {
    // Define version information.
    const VERSION: &str = env!("MYSQLPROBE_BUILD_VERSION");

    let args: Vec<String> = env::args().collect();

    // Handle the --version flag.
    if args.contains(&"--version".to_string()) {
        println!("mysqlprobe version {VERSION}");
        return Ok(());
    }

    let config_path = flag_value(&args, "--config").unwrap_or("probe.toml");
    let Some(pcap_path) = flag_value(&args, "--pcap") else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };

    // The probe cannot run without a valid configuration.
    let mut config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // Override the server port if provided as a command-line argument.
    if let Some(port_str) = flag_value(&args, "--port") {
        let Ok(port) = port_str.parse::<u16>() else {
            eprintln!("Invalid port number: {port_str}");
            std::process::exit(1);
        };
        if let Err(e) = config.override_probe_port(port) {
            eprintln!("Invalid configuration with --port {port_str}: {e:#}");
            std::process::exit(1);
        }
    }

    // Get initial log level from env var or config.
    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());

    // Records go to stdout, so logs go to stderr.
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let reload_handle = Arc::new(reload_handle);

    if let Err(e) = server::run(config, config_path, pcap_path, reload_handle).await {
        error!("Probe runtime error: {:#}", e);
        return Err(e);
    }

    Ok(())
}
