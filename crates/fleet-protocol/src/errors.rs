//! Fleet protocol error types.

use std::time::Duration;
use thiserror::Error;

use certfleet_common::{ActionResult, CommandId, InstanceId};

/// Fleet protocol errors
#[derive(Error, Debug)]
pub enum FleetProtocolError {
    #[error("Instance {0} has no live connection")]
    AgentUnreachable(InstanceId),

    #[error("Instance {0} disconnected while the command was outstanding")]
    AgentDisconnected(InstanceId),

    #[error("Command {command_id} timed out after {timeout:?}")]
    CommandTimedOut {
        command_id: CommandId,
        timeout: Duration,
    },

    #[error("Command {0} is already awaiting a result")]
    DuplicateCorrelation(CommandId),

    #[error("Command {command_type} failed on instance: {message}")]
    CommandFailed {
        command_type: String,
        message: String,
    },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Missing required argument '{0}'")]
    MissingArgument(String),

    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FleetProtocolError {
    /// Whether the target instance should be treated as offline.
    ///
    /// Timeouts count as offline: callers handle them as a normal outcome
    /// rather than a fault.
    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            FleetProtocolError::AgentUnreachable(_)
                | FleetProtocolError::AgentDisconnected(_)
                | FleetProtocolError::CommandTimedOut { .. }
        )
    }
}

impl From<FleetProtocolError> for ActionResult {
    fn from(err: FleetProtocolError) -> Self {
        ActionResult::failure(err.to_string())
    }
}
