//! Managed challenge resolution for Certfleet.
//!
//! A managed challenge is a pre-configured domain-validation responder that
//! the hub can run on behalf of another ACME client. This crate selects the
//! best configuration for a requested identifier and drives its record
//! provider through create and cleanup.

pub mod config;
pub mod errors;
pub mod matcher;
pub mod provider;
pub mod store;
pub mod workflow;

pub use config::{ChallengeMaterial, ChallengeRequest, ManagedChallengeConfig, CHALLENGE_TYPE_DNS};
pub use errors::{ChallengeError, NO_MATCH_MESSAGE};
pub use matcher::{find_best_match, wildcard_matches};
pub use provider::{
    DnsRecord, InMemoryRecordProvider, ManualRecordProvider, RecordProvider, RecordProviders,
    IN_MEMORY_PROVIDER_ID, MANUAL_PROVIDER_ID,
};
pub use store::{InMemoryChallengeStore, ManagedChallengeStore};
pub use workflow::{ChallengePhase, ChallengeWorkflow};
