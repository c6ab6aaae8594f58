//! Hub and instance KDL parsing.

use anyhow::Result;
use tracing::trace;

use crate::hub::*;
use crate::instance::*;

use super::helpers::{get_string_entry, get_u64_entry};

/// Parse the `hub` block
pub fn parse_hub_config(node: &kdl::KdlNode) -> Result<HubConfig> {
    trace!("Parsing hub configuration block");

    let config = HubConfig {
        listen: get_string_entry(node, "listen").unwrap_or_else(default_listen),
        command_timeout_secs: get_u64_entry(node, "command-timeout-secs")?
            .unwrap_or_else(default_command_timeout),
        heartbeat_timeout_secs: get_u64_entry(node, "heartbeat-timeout-secs")?
            .unwrap_or_else(default_heartbeat_timeout),
        sweep_interval_secs: get_u64_entry(node, "sweep-interval-secs")?
            .unwrap_or_else(default_sweep_interval),
        max_message_size: get_u64_entry(node, "max-message-size")?
            .map(|v| v as usize)
            .unwrap_or_else(default_max_message_size),
    };

    trace!(
        listen = %config.listen,
        command_timeout_secs = config.command_timeout_secs,
        heartbeat_timeout_secs = config.heartbeat_timeout_secs,
        "Parsed hub configuration"
    );

    Ok(config)
}

/// Parse the `instance` block
pub fn parse_instance_config(node: &kdl::KdlNode) -> Result<InstanceConfig> {
    trace!("Parsing instance configuration block");

    let instance_id = get_string_entry(node, "instance-id").ok_or_else(|| {
        anyhow::anyhow!("Instance block requires an 'instance-id' field, e.g., instance-id \"edge-01\"")
    })?;

    let config = InstanceConfig {
        title: get_string_entry(node, "title").unwrap_or_else(|| instance_id.clone()),
        instance_id,
        hub_address: get_string_entry(node, "hub-address").unwrap_or_else(default_hub_address),
        heartbeat_interval_secs: get_u64_entry(node, "heartbeat-interval-secs")?
            .unwrap_or_else(default_heartbeat_interval),
        reconnect_interval_secs: get_u64_entry(node, "reconnect-interval-secs")?
            .unwrap_or_else(default_reconnect_interval),
    };

    trace!(
        instance_id = %config.instance_id,
        hub_address = %config.hub_address,
        "Parsed instance configuration"
    );

    Ok(config)
}
