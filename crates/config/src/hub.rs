//! Hub process configuration.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Settings of the hub process: listener and command/liveness timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct HubConfig {
    /// Address instances connect to
    #[validate(length(min = 1, message = "listen address must not be empty"))]
    pub listen: String,

    /// Bound on one command round trip
    #[validate(range(min = 1, max = 3600))]
    pub command_timeout_secs: u64,

    /// Silence after which an instance is treated as disconnected
    #[validate(range(min = 1, max = 3600))]
    pub heartbeat_timeout_secs: u64,

    #[validate(range(min = 1, max = 3600))]
    pub sweep_interval_secs: u64,

    /// Largest accepted frame, in bytes
    #[validate(range(min = 1024))]
    pub max_message_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            command_timeout_secs: default_command_timeout(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            max_message_size: default_max_message_size(),
        }
    }
}

pub fn default_listen() -> String {
    "0.0.0.0:7800".to_string()
}

pub fn default_command_timeout() -> u64 {
    30
}

pub fn default_heartbeat_timeout() -> u64 {
    90
}

pub fn default_sweep_interval() -> u64 {
    15
}

pub fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}
