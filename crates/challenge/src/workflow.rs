//! Two-phase (create/cleanup) challenge fulfillment.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use certfleet_common::ActionResult;

use crate::config::{ChallengeRequest, ManagedChallengeConfig};
use crate::errors::ChallengeError;
use crate::matcher::find_best_match;
use crate::provider::{DnsRecord, RecordProviders};
use crate::store::ManagedChallengeStore;

/// Lifecycle of one (identifier, response key) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChallengePhase {
    #[default]
    Idle,
    Creating,
    Created,
    CreationFailed,
    AwaitingUser,
    Cleaning,
    Cleaned,
    CleanupFailed,
}

type PhaseKey = (String, String);

fn phase_key(request: &ChallengeRequest) -> PhaseKey {
    (
        request.identifier.trim().to_lowercase(),
        request.response_key.trim().to_lowercase(),
    )
}

/// Drives matched configurations through their record provider.
///
/// The configuration collection is read from the store on every call, so
/// edits made between create and cleanup are picked up.
pub struct ChallengeWorkflow {
    store: Arc<dyn ManagedChallengeStore>,
    providers: RecordProviders,
    phases: DashMap<PhaseKey, ChallengePhase>,
}

impl ChallengeWorkflow {
    pub fn new(store: Arc<dyn ManagedChallengeStore>, providers: RecordProviders) -> Self {
        Self {
            store,
            providers,
            phases: DashMap::new(),
        }
    }

    pub fn providers(&self) -> &RecordProviders {
        &self.providers
    }

    pub fn store(&self) -> &Arc<dyn ManagedChallengeStore> {
        &self.store
    }

    /// Current phase for the request's (identifier, response key) pair.
    ///
    /// A pair whose cleanup succeeded is forgotten and reads as `Idle` again.
    pub fn phase(&self, request: &ChallengeRequest) -> ChallengePhase {
        self.phases
            .get(&phase_key(request))
            .map(|p| *p)
            .unwrap_or_default()
    }

    /// Number of (identifier, response key) pairs currently tracked.
    pub fn tracked(&self) -> usize {
        self.phases.len()
    }

    /// Best matching configuration for `identifier`, read fresh from the store.
    pub async fn resolve(
        &self,
        identifier: &str,
    ) -> Result<Option<ManagedChallengeConfig>, ChallengeError> {
        let configs = self.store.list().await?;
        Ok(find_best_match(identifier, &configs).cloned())
    }

    /// Publish the response record for `request`.
    pub async fn perform_create(&self, request: &ChallengeRequest) -> ActionResult {
        let key = phase_key(request);
        self.phases.insert(key.clone(), ChallengePhase::Creating);

        let (phase, result) = match self.create(request).await {
            Ok(message) => {
                info!(identifier = %request.identifier, "{}", message);
                (ChallengePhase::Created, ActionResult::success(message))
            }
            Err(ChallengeError::AwaitingUserAction(message)) => {
                warn!(identifier = %request.identifier, "Action required: {}", message);
                (ChallengePhase::AwaitingUser, ActionResult::awaiting_user(message))
            }
            Err(e) => {
                error!(identifier = %request.identifier, error = %e, "Challenge response failed");
                (ChallengePhase::CreationFailed, e.into())
            }
        };

        self.phases.insert(key, phase);
        result
    }

    /// Withdraw the response record for `request`.
    ///
    /// Independent of any earlier create: it runs whatever phase the pair is in.
    pub async fn perform_cleanup(&self, request: &ChallengeRequest) -> ActionResult {
        let key = phase_key(request);
        let previous = self.phases.insert(key.clone(), ChallengePhase::Cleaning);
        debug!(
            identifier = %request.identifier,
            previous_phase = ?previous.unwrap_or_default(),
            "Starting challenge cleanup"
        );

        let (phase, result) = match self.cleanup(request).await {
            Ok(message) => {
                info!(identifier = %request.identifier, "{}", message);
                (ChallengePhase::Cleaned, ActionResult::success(message))
            }
            Err(ChallengeError::AwaitingUserAction(message)) => {
                warn!(identifier = %request.identifier, "Action required: {}", message);
                (ChallengePhase::CleanupFailed, ActionResult::awaiting_user(message))
            }
            Err(e) => {
                error!(identifier = %request.identifier, error = %e, "Challenge cleanup failed");
                (ChallengePhase::CleanupFailed, e.into())
            }
        };

        if phase == ChallengePhase::Cleaned {
            // Leave the pair alone if a new create started meanwhile.
            self.phases
                .remove_if(&key, |_, current| *current == ChallengePhase::Cleaning);
            debug!(identifier = %request.identifier, phase = ?phase, "Challenge pair released");
        } else {
            self.phases.insert(key, phase);
        }
        result
    }

    async fn create(&self, request: &ChallengeRequest) -> Result<String, ChallengeError> {
        let (provider, record) = self.prepare(request).await?;
        check_outcome(provider.create_record(&record).await)?;
        Ok(format!(
            "Challenge response {} completed {} : {}",
            request.challenge_type, request.response_key, request.response_value
        ))
    }

    async fn cleanup(&self, request: &ChallengeRequest) -> Result<String, ChallengeError> {
        let (provider, record) = self.prepare(request).await?;
        check_outcome(provider.delete_record(&record).await)?;
        Ok(format!(
            "Challenge cleanup {} completed {} : {}",
            request.challenge_type, request.response_key, request.response_value
        ))
    }

    async fn prepare(
        &self,
        request: &ChallengeRequest,
    ) -> Result<(Arc<dyn crate::provider::RecordProvider>, DnsRecord), ChallengeError> {
        let config = self
            .resolve(&request.identifier)
            .await?
            .ok_or(ChallengeError::NoMatchingChallenge)?;

        let provider_id = config.challenge.provider.as_str();
        let provider = self
            .providers
            .get(provider_id)
            .ok_or_else(|| ChallengeError::ProviderUnavailable(provider_id.to_string()))?;

        debug!(
            identifier = %request.identifier,
            challenge_id = %config.id,
            provider = %provider_id,
            "Matched managed challenge"
        );

        let record = DnsRecord::new(
            request.response_key.clone(),
            request.response_value.clone(),
            request.identifier.clone(),
            &config.challenge,
        );
        Ok((provider, record))
    }
}

fn check_outcome(outcome: ActionResult) -> Result<(), ChallengeError> {
    if outcome.is_success {
        Ok(())
    } else if outcome.awaiting_user {
        Err(ChallengeError::AwaitingUserAction(outcome.message))
    } else {
        Err(ChallengeError::ProviderFailure(outcome.message))
    }
}
