//! Instance-side command execution.
//!
//! [`AgentCommandExecutor`] decodes one inbound [`CommandEnvelope`], runs the
//! matching [`InstanceHandler`] method and packs the outcome into a
//! [`CommandResult`]. It never fails: decode and handler errors are carried
//! inside the result, and command types this build does not know produce a
//! result with no payload.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use certfleet_challenge::{ChallengeRequest, ManagedChallengeConfig};
use certfleet_common::{ActionResult, InstanceId, StatusSummary};

use crate::commands::{keys, HubCommand};
use crate::models::{
    AccountDetails, ActionStep, CertificateAuthority, ChallengeProviderDefinition,
    ContactRegistration, DeploymentProviderDefinition, DnsZone, LogItem, ManagedItem,
    ManagedItemsSnapshot, StatusMessage, StoredCredential,
};
use crate::protocol::{CommandEnvelope, CommandResult};

/// Local state and operations of a managed instance.
///
/// Every method has a default so an instance only implements what it
/// supports. Queries default to empty results; operations default to an
/// error that is reported back to the hub.
#[async_trait]
pub trait InstanceHandler: Send + Sync {
    async fn get_managed_item(&self, _id: &str) -> anyhow::Result<Option<ManagedItem>> {
        Ok(None)
    }

    async fn get_managed_items(&self) -> anyhow::Result<Vec<ManagedItem>> {
        Ok(Vec::new())
    }

    async fn get_status_summary(&self) -> anyhow::Result<StatusSummary> {
        Ok(StatusSummary::default())
    }

    async fn get_item_log(&self, _id: &str, _limit: u32) -> anyhow::Result<Vec<LogItem>> {
        Ok(Vec::new())
    }

    async fn preview_renewal(&self, _item: &ManagedItem) -> anyhow::Result<Vec<ActionStep>> {
        Ok(Vec::new())
    }

    async fn update_managed_item(&self, _item: ManagedItem) -> anyhow::Result<Option<ManagedItem>> {
        anyhow::bail!("Updating managed items is not supported by this instance")
    }

    async fn remove_managed_item(&self, _id: &str) -> anyhow::Result<bool> {
        anyhow::bail!("Removing managed items is not supported by this instance")
    }

    async fn test_configuration(&self, _item: &ManagedItem) -> anyhow::Result<Vec<StatusMessage>> {
        Ok(Vec::new())
    }

    /// Start a certificate request. Returns once the request is queued.
    async fn perform_request(&self, _id: &str) -> anyhow::Result<()> {
        anyhow::bail!("Certificate requests are not supported by this instance")
    }

    async fn get_certificate_authorities(&self) -> anyhow::Result<Vec<CertificateAuthority>> {
        Ok(Vec::new())
    }

    async fn update_certificate_authority(
        &self,
        _authority: CertificateAuthority,
    ) -> anyhow::Result<ActionResult> {
        anyhow::bail!("Certificate authority changes are not supported by this instance")
    }

    async fn remove_certificate_authority(&self, _id: &str) -> anyhow::Result<ActionResult> {
        anyhow::bail!("Certificate authority changes are not supported by this instance")
    }

    async fn get_acme_accounts(&self) -> anyhow::Result<Vec<AccountDetails>> {
        Ok(Vec::new())
    }

    async fn add_acme_account(
        &self,
        _registration: ContactRegistration,
    ) -> anyhow::Result<ActionResult> {
        anyhow::bail!("Account changes are not supported by this instance")
    }

    async fn remove_acme_account(
        &self,
        _storage_key: &str,
        _deactivate: bool,
    ) -> anyhow::Result<ActionResult> {
        anyhow::bail!("Account changes are not supported by this instance")
    }

    async fn get_stored_credentials(&self) -> anyhow::Result<Vec<StoredCredential>> {
        Ok(Vec::new())
    }

    async fn update_stored_credential(
        &self,
        _credential: StoredCredential,
    ) -> anyhow::Result<ActionResult> {
        anyhow::bail!("Credential changes are not supported by this instance")
    }

    async fn remove_stored_credential(&self, _storage_key: &str) -> anyhow::Result<ActionResult> {
        anyhow::bail!("Credential changes are not supported by this instance")
    }

    async fn get_challenge_providers(&self) -> anyhow::Result<Vec<ChallengeProviderDefinition>> {
        Ok(Vec::new())
    }

    async fn get_dns_zones(
        &self,
        _provider_type_id: &str,
        _credential_id: &str,
    ) -> anyhow::Result<Vec<DnsZone>> {
        Ok(Vec::new())
    }

    async fn get_deployment_providers(&self) -> anyhow::Result<Vec<DeploymentProviderDefinition>> {
        Ok(Vec::new())
    }

    async fn execute_deployment_task(
        &self,
        _item_id: &str,
        _task_id: &str,
    ) -> anyhow::Result<Vec<ActionStep>> {
        anyhow::bail!("Deployment tasks are not supported by this instance")
    }

    async fn get_managed_challenges(&self) -> anyhow::Result<Vec<ManagedChallengeConfig>> {
        Ok(Vec::new())
    }

    async fn update_managed_challenge(
        &self,
        _config: ManagedChallengeConfig,
    ) -> anyhow::Result<ActionResult> {
        anyhow::bail!("Managed challenges are not supported by this instance")
    }

    async fn remove_managed_challenge(&self, _id: &str) -> anyhow::Result<ActionResult> {
        anyhow::bail!("Managed challenges are not supported by this instance")
    }

    async fn perform_managed_challenge(
        &self,
        _request: ChallengeRequest,
    ) -> anyhow::Result<ActionResult> {
        anyhow::bail!("Managed challenges are not supported by this instance")
    }

    async fn cleanup_managed_challenge(
        &self,
        _request: ChallengeRequest,
    ) -> anyhow::Result<ActionResult> {
        anyhow::bail!("Managed challenges are not supported by this instance")
    }
}

/// Executes hub commands against an [`InstanceHandler`].
///
/// Cheap to clone; the connection spawns one task per command with its own
/// clone so slow commands never hold up others.
#[derive(Clone)]
pub struct AgentCommandExecutor {
    instance_id: InstanceId,
    handler: Arc<dyn InstanceHandler>,
    reconnect: Arc<Notify>,
}

impl AgentCommandExecutor {
    pub fn new(instance_id: InstanceId, handler: Arc<dyn InstanceHandler>) -> Self {
        Self {
            instance_id,
            handler,
            reconnect: Arc::new(Notify::new()),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Signalled when the hub asks the instance to reconnect.
    pub fn reconnect_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.reconnect)
    }

    /// Summary attached to heartbeats. `None` if the handler fails.
    pub async fn heartbeat_summary(&self) -> Option<StatusSummary> {
        match self.handler.get_status_summary().await {
            Ok(mut summary) => {
                summary.instance_id = Some(self.instance_id.to_string());
                Some(summary)
            }
            Err(e) => {
                debug!(instance_id = %self.instance_id, error = %e, "No summary for heartbeat");
                None
            }
        }
    }

    /// Handle one command envelope.
    pub async fn handle(&self, envelope: CommandEnvelope) -> CommandResult {
        let mut result = CommandResult {
            instance_id: Some(self.instance_id.clone()),
            received_at: Some(Utc::now()),
            ..CommandResult::empty(envelope.command_id)
        };

        let args = match envelope.args() {
            Ok(args) => args,
            Err(e) => return failed(result, &envelope, e.to_string()),
        };

        if let Some(target) = args.get(keys::INSTANCE_ID) {
            if target != self.instance_id.as_str() {
                warn!(
                    instance_id = %self.instance_id,
                    target = target,
                    command_id = %envelope.command_id,
                    "Command addressed to a different instance id"
                );
            }
        }

        let command = match HubCommand::decode(&envelope.command_type, &args) {
            Ok(Some(command)) => command,
            Ok(None) => {
                debug!(
                    command_id = %envelope.command_id,
                    command_type = %envelope.command_type,
                    "Ignoring unknown command type"
                );
                return result;
            }
            Err(e) => return failed(result, &envelope, e.to_string()),
        };

        debug!(
            command_id = %envelope.command_id,
            command_type = %envelope.command_type,
            "Executing command"
        );

        match self.execute(command).await {
            Ok(payload) => {
                result.payload = payload;
                result
            }
            Err(e) => failed(result, &envelope, format!("{:#}", e)),
        }
    }

    async fn execute(&self, command: HubCommand) -> anyhow::Result<Option<String>> {
        let h = &self.handler;
        match command {
            HubCommand::GetManagedItem { managed_item_id } => {
                encode(&h.get_managed_item(&managed_item_id).await?)
            }
            HubCommand::GetManagedItems => encode(&ManagedItemsSnapshot {
                instance_id: self.instance_id.to_string(),
                items: h.get_managed_items().await?,
            }),
            HubCommand::GetStatusSummary => {
                let mut summary = h.get_status_summary().await?;
                summary.instance_id = Some(self.instance_id.to_string());
                encode(&summary)
            }
            HubCommand::GetManagedItemLog {
                managed_item_id,
                limit,
            } => encode(&h.get_item_log(&managed_item_id, limit).await?),
            HubCommand::GetManagedItemRenewalPreview { item } => {
                encode(&h.preview_renewal(&item).await?)
            }
            HubCommand::UpdateManagedItem { item } => encode(&h.update_managed_item(item).await?),
            HubCommand::RemoveManagedItem { managed_item_id } => {
                encode(&h.remove_managed_item(&managed_item_id).await?)
            }
            HubCommand::TestManagedItemConfiguration { item } => {
                encode(&h.test_configuration(&item).await?)
            }
            HubCommand::PerformManagedItemRequest { managed_item_id } => {
                h.perform_request(&managed_item_id).await?;
                Ok(None)
            }
            HubCommand::GetCertificateAuthorities => {
                encode(&h.get_certificate_authorities().await?)
            }
            HubCommand::UpdateCertificateAuthority { authority } => {
                encode(&h.update_certificate_authority(authority).await?)
            }
            HubCommand::RemoveCertificateAuthority { id } => {
                encode(&h.remove_certificate_authority(&id).await?)
            }
            HubCommand::GetAcmeAccounts => encode(&h.get_acme_accounts().await?),
            HubCommand::AddAcmeAccount { registration } => {
                encode(&h.add_acme_account(registration).await?)
            }
            HubCommand::RemoveAcmeAccount {
                storage_key,
                deactivate,
            } => encode(&h.remove_acme_account(&storage_key, deactivate).await?),
            HubCommand::GetStoredCredentials => {
                // Secrets never leave the instance.
                let credentials: Vec<StoredCredential> = h
                    .get_stored_credentials()
                    .await?
                    .iter()
                    .map(StoredCredential::redacted)
                    .collect();
                encode(&credentials)
            }
            HubCommand::UpdateStoredCredential { credential } => {
                encode(&h.update_stored_credential(credential).await?)
            }
            HubCommand::RemoveStoredCredential { storage_key } => {
                encode(&h.remove_stored_credential(&storage_key).await?)
            }
            HubCommand::GetChallengeProviders => encode(&h.get_challenge_providers().await?),
            HubCommand::GetDnsZones {
                provider_type_id,
                credential_id,
            } => encode(&h.get_dns_zones(&provider_type_id, &credential_id).await?),
            HubCommand::GetDeploymentProviders => encode(&h.get_deployment_providers().await?),
            HubCommand::ExecuteDeploymentTask {
                managed_item_id,
                task_id,
            } => encode(&h.execute_deployment_task(&managed_item_id, &task_id).await?),
            HubCommand::GetManagedChallenges => encode(&h.get_managed_challenges().await?),
            HubCommand::UpdateManagedChallenge { config } => {
                encode(&h.update_managed_challenge(config).await?)
            }
            HubCommand::RemoveManagedChallenge { id } => {
                encode(&h.remove_managed_challenge(&id).await?)
            }
            HubCommand::PerformManagedChallenge { request } => {
                encode(&h.perform_managed_challenge(request).await?)
            }
            HubCommand::CleanupManagedChallenge { request } => {
                encode(&h.cleanup_managed_challenge(request).await?)
            }
            HubCommand::Reconnect => {
                debug!(instance_id = %self.instance_id, "Reconnect requested by hub");
                self.reconnect.notify_one();
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for AgentCommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCommandExecutor")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

fn encode<T: Serialize>(value: &T) -> anyhow::Result<Option<String>> {
    Ok(Some(serde_json::to_string(value)?))
}

fn failed(mut result: CommandResult, envelope: &CommandEnvelope, message: String) -> CommandResult {
    warn!(
        command_id = %envelope.command_id,
        command_type = %envelope.command_type,
        error = %message,
        "Command failed"
    );
    result.payload = serde_json::to_string(&ActionResult::failure(message.clone())).ok();
    result.error = Some(message);
    result
}
