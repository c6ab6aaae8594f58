//! Instance process configuration.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Identity of a managed instance and how it reaches its hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct InstanceConfig {
    #[validate(length(min = 1, message = "instance id must not be empty"))]
    pub instance_id: String,

    pub title: String,

    /// `host:port` of the hub
    #[validate(length(min = 1, message = "hub address must not be empty"))]
    pub hub_address: String,

    #[validate(range(min = 1, max = 3600))]
    pub heartbeat_interval_secs: u64,

    #[validate(range(min = 1, max = 3600))]
    pub reconnect_interval_secs: u64,
}

impl InstanceConfig {
    pub fn new(instance_id: impl Into<String>) -> Self {
        let instance_id = instance_id.into();
        Self {
            title: instance_id.clone(),
            instance_id,
            hub_address: default_hub_address(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            reconnect_interval_secs: default_reconnect_interval(),
        }
    }
}

pub fn default_hub_address() -> String {
    "127.0.0.1:7800".to_string()
}

pub fn default_heartbeat_interval() -> u64 {
    30
}

pub fn default_reconnect_interval() -> u64 {
    5
}
