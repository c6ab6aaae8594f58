//! Common types shared by the Certfleet hub, its agents and the challenge engine.

pub mod ids;
#[cfg(feature = "runtime")]
pub mod observability;
pub mod types;

pub use ids::{CommandId, InstanceId};
pub use types::{ActionResult, AuthContext, StatusSummary};
