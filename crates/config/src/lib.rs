//! Configuration for Certfleet processes.
//!
//! A single KDL document may carry a `hub` block, an `instance` block and a
//! `challenges` block. Every block is optional; missing settings take the
//! defaults documented on [`HubConfig`] and [`InstanceConfig`].

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use validator::Validate;

use certfleet_challenge::ManagedChallengeConfig;

pub mod hub;
pub mod instance;
pub mod kdl;

pub use hub::HubConfig;
pub use instance::InstanceConfig;

/// Complete configuration document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub hub: Option<HubConfig>,
    pub instance: Option<InstanceConfig>,
    /// Managed challenges seeded into the instance's store
    pub challenges: Vec<ManagedChallengeConfig>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        let config = Self::from_kdl_str(&source)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Parse and validate KDL source.
    pub fn from_kdl_str(source: &str) -> Result<Self> {
        let config = kdl::parse_config(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check field ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(hub) = &self.hub {
            Validate::validate(hub).map_err(|e| anyhow::anyhow!("Invalid hub configuration: {}", e))?;
            if hub.heartbeat_timeout_secs <= hub.sweep_interval_secs {
                anyhow::bail!(
                    "Hub heartbeat-timeout-secs ({}) must exceed sweep-interval-secs ({})",
                    hub.heartbeat_timeout_secs,
                    hub.sweep_interval_secs
                );
            }
        }

        if let Some(instance) = &self.instance {
            Validate::validate(instance)
                .map_err(|e| anyhow::anyhow!("Invalid instance configuration: {}", e))?;
            if let Some(hub) = &self.hub {
                if instance.heartbeat_interval_secs >= hub.heartbeat_timeout_secs {
                    anyhow::bail!(
                        "Instance heartbeat-interval-secs ({}) must be shorter than the hub's heartbeat-timeout-secs ({})",
                        instance.heartbeat_interval_secs,
                        hub.heartbeat_timeout_secs
                    );
                }
            }
        }

        let mut seen = HashSet::new();
        for challenge in &self.challenges {
            if !seen.insert(challenge.id.as_str()) {
                anyhow::bail!("Duplicate challenge id '{}'", challenge.id);
            }
        }

        debug!("Configuration validated");
        Ok(())
    }

    /// Hub settings, or the defaults when the block is absent.
    pub fn hub_or_default(&self) -> HubConfig {
        self.hub.clone().unwrap_or_default()
    }

    /// Replace the instance's hub address, e.g. from `CERTFLEET_HUB`.
    pub fn override_hub_address(&mut self, address: Option<String>) {
        if let (Some(instance), Some(address)) = (self.instance.as_mut(), address) {
            debug!(hub_address = %address, "Overriding hub address");
            instance.hub_address = address;
        }
    }
}

impl HubConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl InstanceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}
