//! KDL document parsing.

use anyhow::{Context, Result};
use tracing::debug;

use crate::Config;

mod challenges;
mod helpers;
mod server;

pub use challenges::parse_challenges;
pub use server::{parse_hub_config, parse_instance_config};

/// Build a [`Config`] from KDL source.
pub fn parse_config(source: &str) -> Result<Config> {
    let doc: kdl::KdlDocument = source.parse().context("Failed to parse KDL")?;
    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "hub" => config.hub = Some(parse_hub_config(node)?),
            "instance" => config.instance = Some(parse_instance_config(node)?),
            "challenges" => config.challenges.extend(parse_challenges(node)?),
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown top-level block '{}'. Valid blocks: hub, instance, challenges",
                    other
                ));
            }
        }
    }

    debug!(
        hub = config.hub.is_some(),
        instance = config.instance.is_some(),
        challenges = config.challenges.len(),
        "Parsed configuration"
    );
    Ok(config)
}
