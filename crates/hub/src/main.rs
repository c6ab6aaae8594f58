//! Certfleet Hub - Main entry point
//!
//! Accepts persistent connections from managed instances and runs the
//! liveness sweep that retires silent ones.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use certfleet_common::observability::{init_tracing, LogOptions};
use certfleet_config::{Config, HubConfig};
use certfleet_fleet_protocol::{
    CommandDispatcher, ConnectionRegistry, CorrelationTable, DispatcherConfig, HubServer,
    HubServerConfig,
};

/// Certfleet hub - central command point for managed certificate instances
#[derive(Parser, Debug)]
#[command(name = "certfleet-hub")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTFLEET_CONFIG")]
    config: Option<String>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long = "json-logs")]
    json_logs: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(LogOptions {
        verbose: cli.verbose,
        json: cli.json_logs,
    })?;

    let config = load_config(cli.config.as_deref())?;

    if cli.test {
        return test_config(&config, cli.config.as_deref());
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(run_hub(config.hub_or_default()))
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path).context("Failed to load configuration file"),
        None => {
            info!("No configuration specified, using defaults");
            Ok(Config::default())
        }
    }
}

/// Report on a validated configuration and exit
fn test_config(config: &Config, path: Option<&str>) -> Result<()> {
    let hub = config.hub_or_default();

    info!("Configuration test successful:");
    info!("  - listen address {}", hub.listen);
    info!(
        "  - command timeout {}s, heartbeat threshold {}s, sweep every {}s",
        hub.command_timeout_secs, hub.heartbeat_timeout_secs, hub.sweep_interval_secs
    );
    info!("  - {} managed challenge(s)", config.challenges.len());

    if config.instance.is_some() {
        warn!("Instance block is ignored by the hub");
    }

    println!(
        "certfleet-hub: configuration {} test is successful",
        path.unwrap_or("(defaults)")
    );
    Ok(())
}

fn build_server(hub: &HubConfig) -> HubServer {
    let dispatcher = CommandDispatcher::new(
        Arc::new(ConnectionRegistry::new()),
        Arc::new(CorrelationTable::new()),
        DispatcherConfig {
            command_timeout: hub.command_timeout(),
            heartbeat_timeout: hub.heartbeat_timeout(),
            sweep_interval: hub.sweep_interval(),
        },
    );
    HubServer::new(
        dispatcher,
        HubServerConfig {
            max_message_size: hub.max_message_size,
            ..Default::default()
        },
    )
}

async fn run_hub(hub: HubConfig) -> Result<()> {
    let server = build_server(&hub);
    let shutdown = CancellationToken::new();

    let listener = TcpListener::bind(&hub.listen)
        .await
        .with_context(|| format!("Failed to bind {}", hub.listen))?;

    let sweep = {
        let dispatcher = server.dispatcher().clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run_liveness_sweep(shutdown).await })
    };

    let serve = {
        let server = server.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.run(listener, shutdown).await })
    };

    wait_for_shutdown().await;
    info!(
        connected = server.dispatcher().registry().connected_count(),
        "Shutting down hub"
    );
    shutdown.cancel();

    let _ = sweep.await;
    serve.await.context("Listener task failed")??;
    info!("Hub stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, waiting for SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl-C");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from(["certfleet-hub", "-c", "hub.kdl", "--test", "--json-logs"]);
        assert_eq!(cli.config.as_deref(), Some("hub.kdl"));
        assert!(cli.test);
        assert!(cli.json_logs);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_server_uses_configured_timing() {
        let hub = HubConfig {
            command_timeout_secs: 12,
            heartbeat_timeout_secs: 40,
            sweep_interval_secs: 4,
            ..Default::default()
        };
        let server = build_server(&hub);
        let config = server.dispatcher().config();
        assert_eq!(config.command_timeout, Duration::from_secs(12));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(40));
        assert_eq!(config.sweep_interval, Duration::from_secs(4));
    }
}
