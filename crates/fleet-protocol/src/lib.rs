//! Fleet command protocol for Certfleet.
//!
//! The hub keeps one persistent connection per managed instance. Commands
//! travel hub to instance as [`CommandEnvelope`]s and come back as
//! [`CommandResult`]s carrying the same command id.
//!
//! # Hub side
//!
//! - [`ConnectionRegistry`]: live connections plus cached instance state
//! - [`CorrelationTable`]: outstanding commands awaiting a result
//! - [`CommandDispatcher`]: send a command and wait for its result
//! - [`HubServer`]: accepts instance connections
//!
//! # Instance side
//!
//! - [`InstanceHandler`]: the instance's local operations
//! - [`AgentCommandExecutor`]: decodes and runs one command
//! - [`HubClient`]: connects to the hub and serves commands
//!
//! # Example
//!
//! ```ignore
//! use certfleet_fleet_protocol::{CommandDispatcher, InstanceId};
//! use certfleet_common::AuthContext;
//!
//! let summary = dispatcher
//!     .get_status_summary(&InstanceId::new("edge-01"), &AuthContext::system())
//!     .await?;
//! ```

pub mod client;
pub mod commands;
pub mod correlation;
pub mod dispatcher;
pub mod errors;
pub mod executor;
pub mod frame;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::{HubClient, HubClientConfig, SessionEnd};
pub use commands::{keys, HubCommand};
pub use correlation::{CorrelationTable, PendingResult};
pub use dispatcher::{CommandDispatcher, DispatcherConfig, SweepReport};
pub use errors::FleetProtocolError;
pub use executor::{AgentCommandExecutor, InstanceHandler};
pub use frame::{read_message, recv_message, send_message, write_message, HubMessage, MessageType};
pub use models::*;
pub use protocol::{
    CommandArg, CommandArgs, CommandEnvelope, CommandResult, CommandType, HandshakeAck, Heartbeat,
    InstanceInfo, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use registry::{AgentConnection, ConnectionHandle, ConnectionRegistry, InstanceSnapshot};
pub use server::{HubServer, HubServerConfig};

pub use certfleet_common::{ActionResult, AuthContext, CommandId, InstanceId, StatusSummary};
