//! Certfleet reference instance
//!
//! Connects to a hub and answers its commands from in-memory state. Managed
//! challenges from the configuration file are loaded into the instance's
//! challenge store at startup.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use certfleet_challenge::InMemoryChallengeStore;
use certfleet_common::observability::{init_tracing, LogOptions};
use certfleet_config::{Config, InstanceConfig};
use certfleet_reference_instance::{build_client, MemoryInstance};

/// Certfleet reference instance - in-memory managed certificate instance
#[derive(Parser, Debug)]
#[command(name = "certfleet-instance")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTFLEET_CONFIG")]
    config: Option<String>,

    /// Instance id, used when the configuration has no instance block
    #[arg(long = "instance-id", env = "CERTFLEET_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Hub address (host:port), overrides the configuration
    #[arg(long = "hub", env = "CERTFLEET_HUB")]
    hub: Option<String>,

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

    let mut config = match cli.config.as_deref() {
        Some(path) => Config::from_file(path).context("Failed to load configuration file")?,
        None => Config::default(),
    };
    let instance = resolve_instance(&mut config, cli.instance_id, cli.hub)?;

    if cli.test {
        info!("Configuration test successful:");
        info!("  - instance {} ({})", instance.instance_id, instance.title);
        info!("  - hub {}", instance.hub_address);
        info!("  - {} managed challenge(s)", config.challenges.len());
        println!(
            "certfleet-instance: configuration {} test is successful",
            cli.config.as_deref().unwrap_or("(defaults)")
        );
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(run_instance(instance, config))
}

/// Settle the instance identity from the configuration and the command line.
fn resolve_instance(
    config: &mut Config,
    instance_id: Option<String>,
    hub: Option<String>,
) -> Result<InstanceConfig> {
    if config.instance.is_none() {
        let id = instance_id.ok_or_else(|| {
            anyhow::anyhow!("No instance block in the configuration; pass --instance-id")
        })?;
        config.instance = Some(InstanceConfig::new(id));
    } else if instance_id.is_some() {
        warn!("--instance-id is ignored when the configuration has an instance block");
    }
    config.override_hub_address(hub);
    config.validate()?;
    config
        .instance
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Instance configuration missing"))
}

async fn run_instance(instance: InstanceConfig, config: Config) -> Result<()> {
    let store = Arc::new(InMemoryChallengeStore::with_items(config.challenges));
    info!(
        instance_id = %instance.instance_id,
        challenges = store.len(),
        "Starting instance"
    );

    let client = build_client(&instance, Arc::new(MemoryInstance::with_challenge_store(store)));
    let shutdown = CancellationToken::new();

    let session = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client.run(shutdown).await })
    };

    tokio::select! {
        _ = wait_for_shutdown() => {}
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    session.await.context("Client task failed")??;
    info!("Instance stopped");
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

    #[test]
    fn test_instance_id_from_command_line() {
        let mut config = Config::default();
        let instance =
            resolve_instance(&mut config, Some("edge-07".into()), Some("10.0.0.5:7800".into()))
                .unwrap();
        assert_eq!(instance.instance_id, "edge-07");
        assert_eq!(instance.hub_address, "10.0.0.5:7800");
    }

    #[test]
    fn test_instance_id_required() {
        let mut config = Config::default();
        let err = resolve_instance(&mut config, None, None).unwrap_err();
        assert!(err.to_string().contains("--instance-id"));
    }

    #[test]
    fn test_configured_instance_wins() {
        let mut config = Config::from_kdl_str("instance { instance-id \"edge-01\" }").unwrap();
        let instance = resolve_instance(&mut config, Some("other".into()), None).unwrap();
        assert_eq!(instance.instance_id, "edge-01");
        assert_eq!(instance.hub_address, "127.0.0.1:7800");
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from(["certfleet-instance", "--instance-id", "edge-01", "--hub", "hub:7800"]);
        assert_eq!(cli.instance_id.as_deref(), Some("edge-01"));
        assert_eq!(cli.hub.as_deref(), Some("hub:7800"));
        assert!(!cli.test);
    }
}
