//! Hub-side command dispatcher.
//!
//! Sends a command to one instance and waits for its correlated result.
//! Commands to different instances never share a lock; the only suspension
//! point is the wait on the correlation table.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use certfleet_challenge::{ChallengeRequest, ManagedChallengeConfig};
use certfleet_common::{ActionResult, AuthContext, CommandId, InstanceId, StatusSummary};

use crate::commands::{keys, HubCommand};
use crate::correlation::CorrelationTable;
use crate::frame::HubMessage;
use crate::models::{
    AccountDetails, ActionStep, CertificateAuthority, ChallengeProviderDefinition,
    ContactRegistration, DeploymentProviderDefinition, DnsZone, LogItem, ManagedItem,
    ManagedItemsSnapshot, StatusMessage, StoredCredential,
};
use crate::protocol::{CommandArgs, CommandEnvelope, CommandResult, CommandType};
use crate::registry::ConnectionRegistry;
use crate::FleetProtocolError;

/// Dispatcher timing configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Bound on a single command round trip
    pub command_timeout: Duration,
    /// Silence after which an instance is treated as disconnected
    pub heartbeat_timeout: Duration,
    /// Interval of the liveness sweep
    pub sweep_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(15),
        }
    }
}

/// Outcome of one liveness sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub disconnected: Vec<InstanceId>,
    pub abandoned: usize,
    pub purged: usize,
}

/// Server-side entry point for instance commands.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
    correlations: Arc<CorrelationTable>,
    config: DispatcherConfig,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        correlations: Arc<CorrelationTable>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            correlations,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn correlations(&self) -> &Arc<CorrelationTable> {
        &self.correlations
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Send a raw command and wait for its result.
    ///
    /// Fails with `AgentUnreachable` before anything is registered when the
    /// instance has no live connection.
    pub async fn send(
        &self,
        instance_id: &InstanceId,
        command_type: CommandType,
        args: CommandArgs,
        auth: &AuthContext,
    ) -> Result<CommandResult, FleetProtocolError> {
        let (command_id, pending) = self.transmit(instance_id, command_type, args, auth).await?;
        let result = self
            .correlations
            .await_result(pending, self.config.command_timeout)
            .await;

        match &result {
            Ok(r) => debug!(
                instance_id = %instance_id,
                command_id = %command_id,
                failed = r.is_failure(),
                "Command result received"
            ),
            Err(e) => warn!(
                instance_id = %instance_id,
                command_id = %command_id,
                error = %e,
                "Command did not complete"
            ),
        }
        result
    }

    /// Send a raw command without waiting.
    ///
    /// The correlation entry is still registered; a detached task consumes
    /// the result when it arrives or when the command times out.
    pub async fn send_no_wait(
        &self,
        instance_id: &InstanceId,
        command_type: CommandType,
        args: CommandArgs,
        auth: &AuthContext,
    ) -> Result<CommandId, FleetProtocolError> {
        let (command_id, pending) = self.transmit(instance_id, command_type, args, auth).await?;

        let correlations = Arc::clone(&self.correlations);
        let timeout = self.config.command_timeout;
        let instance_id = instance_id.clone();
        tokio::spawn(async move {
            match correlations.await_result(pending, timeout).await {
                Ok(result) => debug!(
                    instance_id = %instance_id,
                    command_id = %command_id,
                    failed = result.is_failure(),
                    "Unawaited command completed"
                ),
                Err(e) => debug!(
                    instance_id = %instance_id,
                    command_id = %command_id,
                    error = %e,
                    "Unawaited command did not complete"
                ),
            }
        });

        Ok(command_id)
    }

    async fn transmit(
        &self,
        instance_id: &InstanceId,
        command_type: CommandType,
        args: CommandArgs,
        auth: &AuthContext,
    ) -> Result<(CommandId, crate::correlation::PendingResult), FleetProtocolError> {
        let handle = self
            .registry
            .lookup(instance_id)
            .ok_or_else(|| FleetProtocolError::AgentUnreachable(instance_id.clone()))?;

        let args = if args.get(keys::INSTANCE_ID).is_some() {
            args
        } else {
            CommandArgs::new()
                .with(keys::INSTANCE_ID, instance_id.as_str())
                .extend(args)
        };
        let envelope = CommandEnvelope::new(command_type, &args)?;
        let command_id = envelope.command_id;

        let pending = self
            .correlations
            .register(command_id, instance_id, handle.connection_id())?;

        debug!(
            instance_id = %instance_id,
            command_id = %command_id,
            command_type = %envelope.command_type,
            principal = %auth.principal(),
            "Dispatching command"
        );

        if let Err(e) = handle.send(HubMessage::CommandRequest(envelope)).await {
            self.correlations.forget(&command_id);
            warn!(instance_id = %instance_id, command_id = %command_id, error = %e, "Failed to queue command");
            return Err(FleetProtocolError::AgentUnreachable(instance_id.clone()));
        }

        Ok((command_id, pending))
    }

    /// Send a typed command and decode its payload.
    ///
    /// A failure reported by the instance becomes `CommandFailed`.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        instance_id: &InstanceId,
        command: &HubCommand,
        auth: &AuthContext,
    ) -> Result<Option<T>, FleetProtocolError> {
        if command.is_mutating() {
            info!(
                instance_id = %instance_id,
                command_type = %command.command_type(),
                principal = %auth.principal(),
                "Mutating command requested"
            );
        }

        let result = self
            .send(instance_id, command.command_type(), command.to_args()?, auth)
            .await?;

        if let Some(message) = result.error {
            return Err(FleetProtocolError::CommandFailed {
                command_type: command.command_type().to_string(),
                message,
            });
        }
        result.decode()
    }

    /// Aggregate status over the cached summaries of every known instance.
    pub fn aggregate_status_summary(&self, auth: &AuthContext) -> StatusSummary {
        let mut total = StatusSummary::default();
        for (_, summary) in self.registry.summaries() {
            if let Some(summary) = summary {
                total.accumulate(&summary);
            }
        }
        debug!(principal = %auth.principal(), total = total.total, "Aggregated status summary");
        total
    }

    /// Drop an instance's connection and release all its waiters.
    pub fn disconnect_instance(&self, instance_id: &InstanceId) -> usize {
        if let Some(conn) = self.registry.on_disconnect(instance_id) {
            conn.handle.close();
        }
        self.correlations.abandon_instance(instance_id)
    }

    /// One pass of the liveness sweep.
    pub fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for instance_id in self.registry.stale_instances(self.config.heartbeat_timeout) {
            warn!(
                instance_id = %instance_id,
                threshold = ?self.config.heartbeat_timeout,
                "Instance silent past heartbeat threshold, disconnecting"
            );
            report.abandoned += self.disconnect_instance(&instance_id);
            report.disconnected.push(instance_id);
        }

        report.purged = self.correlations.purge_stale(self.config.command_timeout * 2);
        report
    }

    /// Run the liveness sweep until `shutdown` is cancelled.
    pub async fn run_liveness_sweep(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Liveness sweep stopped");
                    return;
                }
                _ = interval.tick() => {
                    let report = self.sweep_once();
                    if !report.disconnected.is_empty() {
                        info!(
                            disconnected = report.disconnected.len(),
                            abandoned = report.abandoned,
                            "Liveness sweep removed stale instances"
                        );
                    }
                }
            }
        }
    }

    // Typed operations. Each mirrors one command and applies the cache side
    // effects for the commands that change what the hub displays.

    pub async fn get_managed_item(
        &self,
        instance_id: &InstanceId,
        managed_item_id: &str,
        auth: &AuthContext,
    ) -> Result<Option<ManagedItem>, FleetProtocolError> {
        let command = HubCommand::GetManagedItem {
            managed_item_id: managed_item_id.to_string(),
        };
        Ok(self.execute::<Option<ManagedItem>>(instance_id, &command, auth).await?.flatten())
    }

    pub async fn get_managed_items(
        &self,
        instance_id: &InstanceId,
        auth: &AuthContext,
    ) -> Result<Vec<ManagedItem>, FleetProtocolError> {
        let snapshot: Option<ManagedItemsSnapshot> = self
            .execute(instance_id, &HubCommand::GetManagedItems, auth)
            .await?;
        let items = snapshot.map(|s| s.items).unwrap_or_default();
        self.registry.replace_cached_items(instance_id, items.clone());
        Ok(items)
    }

    pub async fn get_status_summary(
        &self,
        instance_id: &InstanceId,
        auth: &AuthContext,
    ) -> Result<StatusSummary, FleetProtocolError> {
        let summary: StatusSummary = self
            .execute(instance_id, &HubCommand::GetStatusSummary, auth)
            .await?
            .unwrap_or_default();
        self.registry.update_cached_summary(instance_id, summary.clone());
        Ok(summary)
    }

    pub async fn get_item_log(
        &self,
        instance_id: &InstanceId,
        managed_item_id: &str,
        limit: u32,
        auth: &AuthContext,
    ) -> Result<Vec<LogItem>, FleetProtocolError> {
        let command = HubCommand::GetManagedItemLog {
            managed_item_id: managed_item_id.to_string(),
            limit,
        };
        Ok(self.execute(instance_id, &command, auth).await?.unwrap_or_default())
    }

    pub async fn get_renewal_preview(
        &self,
        instance_id: &InstanceId,
        item: &ManagedItem,
        auth: &AuthContext,
    ) -> Result<Vec<ActionStep>, FleetProtocolError> {
        let command = HubCommand::GetManagedItemRenewalPreview { item: item.clone() };
        Ok(self.execute(instance_id, &command, auth).await?.unwrap_or_default())
    }

    pub async fn update_managed_item(
        &self,
        instance_id: &InstanceId,
        item: &ManagedItem,
        auth: &AuthContext,
    ) -> Result<Option<ManagedItem>, FleetProtocolError> {
        let command = HubCommand::UpdateManagedItem { item: item.clone() };
        let updated = self
            .execute::<Option<ManagedItem>>(instance_id, &command, auth)
            .await?
            .flatten();
        if let Some(updated) = &updated {
            self.registry.update_cached_item(instance_id, updated.clone());
        }
        Ok(updated)
    }

    pub async fn remove_managed_item(
        &self,
        instance_id: &InstanceId,
        managed_item_id: &str,
        auth: &AuthContext,
    ) -> Result<bool, FleetProtocolError> {
        let command = HubCommand::RemoveManagedItem {
            managed_item_id: managed_item_id.to_string(),
        };
        let removed = self
            .execute::<bool>(instance_id, &command, auth)
            .await?
            .unwrap_or(false);
        if removed {
            self.registry.evict_cached_item(instance_id, managed_item_id);
        }
        Ok(removed)
    }

    pub async fn test_managed_item_configuration(
        &self,
        instance_id: &InstanceId,
        item: &ManagedItem,
        auth: &AuthContext,
    ) -> Result<Vec<StatusMessage>, FleetProtocolError> {
        let command = HubCommand::TestManagedItemConfiguration { item: item.clone() };
        Ok(self.execute(instance_id, &command, auth).await?.unwrap_or_default())
    }

    /// Start a certificate request on the instance without waiting for it.
    pub async fn perform_managed_item_request(
        &self,
        instance_id: &InstanceId,
        managed_item_id: &str,
        auth: &AuthContext,
    ) -> Result<CommandId, FleetProtocolError> {
        let command = HubCommand::PerformManagedItemRequest {
            managed_item_id: managed_item_id.to_string(),
        };
        self.send_no_wait(instance_id, command.command_type(), command.to_args()?, auth)
            .await
    }

    pub async fn get_certificate_authorities(
        &self,
        instance_id: &InstanceId,
        auth: &AuthContext,
    ) -> Result<Vec<CertificateAuthority>, FleetProtocolError> {
        Ok(self
            .execute(instance_id, &HubCommand::GetCertificateAuthorities, auth)
            .await?
            .unwrap_or_default())
    }

    pub async fn update_certificate_authority(
        &self,
        instance_id: &InstanceId,
        authority: &CertificateAuthority,
        auth: &AuthContext,
    ) -> Result<ActionResult, FleetProtocolError> {
        let command = HubCommand::UpdateCertificateAuthority {
            authority: authority.clone(),
        };
        self.action(instance_id, &command, auth).await
    }

    pub async fn remove_certificate_authority(
        &self,
        instance_id: &InstanceId,
        id: &str,
        auth: &AuthContext,
    ) -> Result<ActionResult, FleetProtocolError> {
        let command = HubCommand::RemoveCertificateAuthority { id: id.to_string() };
        self.action(instance_id, &command, auth).await
    }

    pub async fn get_acme_accounts(
        &self,
        instance_id: &InstanceId,
        auth: &AuthContext,
    ) -> Result<Vec<AccountDetails>, FleetProtocolError> {
        Ok(self
            .execute(instance_id, &HubCommand::GetAcmeAccounts, auth)
            .await?
            .unwrap_or_default())
    }

    pub async fn add_acme_account(
        &self,
        instance_id: &InstanceId,
        registration: &ContactRegistration,
        auth: &AuthContext,
    ) -> Result<ActionResult, FleetProtocolError> {
        let command = HubCommand::AddAcmeAccount {
            registration: registration.clone(),
        };
        self.action(instance_id, &command, auth).await
    }

    pub async fn remove_acme_account(
        &self,
        instance_id: &InstanceId,
        storage_key: &str,
        deactivate: bool,
        auth: &AuthContext,
    ) -> Result<ActionResult, FleetProtocolError> {
        let command = HubCommand::RemoveAcmeAccount {
            storage_key: storage_key.to_string(),
            deactivate,
        };
        self.action(instance_id, &command, auth).await
    }

    pub async fn get_stored_credentials(
        &self,
        instance_id: &InstanceId,
        auth: &AuthContext,
    ) -> Result<Vec<StoredCredential>, FleetProtocolError> {
        Ok(self
            .execute(instance_id, &HubCommand::GetStoredCredentials, auth)
            .await?
            .unwrap_or_default())
    }

    pub async fn update_stored_credential(
        &self,
        instance_id: &InstanceId,
        credential: &StoredCredential,
        auth: &AuthContext,
    ) -> Result<ActionResult, FleetProtocolError> {
        let command = HubCommand::UpdateStoredCredential {
            credential: credential.clone(),
        };
        self.action(instance_id, &command, auth).await
    }

    pub async fn remove_stored_credential(
        &self,
        instance_id: &InstanceId,
        storage_key: &str,
        auth: &AuthContext,
    ) -> Result<ActionResult, FleetProtocolError> {
        let command = HubCommand::RemoveStoredCredential {
            storage_key: storage_key.to_string(),
        };
        self.action(instance_id, &command, auth).await
    }

    pub async fn get_challenge_providers(
        &self,
        instance_id: &InstanceId,
        auth: &AuthContext,
    ) -> Result<Vec<ChallengeProviderDefinition>, FleetProtocolError> {
        Ok(self
            .execute(instance_id, &HubCommand::GetChallengeProviders, auth)
            .await?
            .unwrap_or_default())
    }

    pub async fn get_dns_zones(
        &self,
        instance_id: &InstanceId,
        provider_type_id: &str,
        credential_id: &str,
        auth: &AuthContext,
    ) -> Result<Vec<DnsZone>, FleetProtocolError> {
        let command = HubCommand::GetDnsZones {
            provider_type_id: provider_type_id.to_string(),
            credential_id: credential_id.to_string(),
        };
        Ok(self.execute(instance_id, &command, auth).await?.unwrap_or_default())
    }

    pub async fn get_deployment_providers(
        &self,
        instance_id: &InstanceId,
        auth: &AuthContext,
    ) -> Result<Vec<DeploymentProviderDefinition>, FleetProtocolError> {
        Ok(self
            .execute(instance_id, &HubCommand::GetDeploymentProviders, auth)
            .await?
            .unwrap_or_default())
    }

    pub async fn execute_deployment_task(
        &self,
        instance_id: &InstanceId,
        managed_item_id: &str,
        task_id: &str,
        auth: &AuthContext,
    ) -> Result<Vec<ActionStep>, FleetProtocolError> {
        let command = HubCommand::ExecuteDeploymentTask {
            managed_item_id: managed_item_id.to_string(),
            task_id: task_id.to_string(),
        };
        Ok(self.execute(instance_id, &command, auth).await?.unwrap_or_default())
    }

    pub async fn get_managed_challenges(
        &self,
        instance_id: &InstanceId,
        auth: &AuthContext,
    ) -> Result<Vec<ManagedChallengeConfig>, FleetProtocolError> {
        Ok(self
            .execute(instance_id, &HubCommand::GetManagedChallenges, auth)
            .await?
            .unwrap_or_default())
    }

    pub async fn update_managed_challenge(
        &self,
        instance_id: &InstanceId,
        config: &ManagedChallengeConfig,
        auth: &AuthContext,
    ) -> Result<ActionResult, FleetProtocolError> {
        let command = HubCommand::UpdateManagedChallenge {
            config: config.clone(),
        };
        self.action(instance_id, &command, auth).await
    }

    pub async fn remove_managed_challenge(
        &self,
        instance_id: &InstanceId,
        id: &str,
        auth: &AuthContext,
    ) -> Result<ActionResult, FleetProtocolError> {
        let command = HubCommand::RemoveManagedChallenge { id: id.to_string() };
        self.action(instance_id, &command, auth).await
    }

    pub async fn perform_managed_challenge(
        &self,
        instance_id: &InstanceId,
        request: &ChallengeRequest,
        auth: &AuthContext,
    ) -> Result<ActionResult, FleetProtocolError> {
        let command = HubCommand::PerformManagedChallenge {
            request: request.clone(),
        };
        self.action(instance_id, &command, auth).await
    }

    pub async fn cleanup_managed_challenge(
        &self,
        instance_id: &InstanceId,
        request: &ChallengeRequest,
        auth: &AuthContext,
    ) -> Result<ActionResult, FleetProtocolError> {
        let command = HubCommand::CleanupManagedChallenge {
            request: request.clone(),
        };
        self.action(instance_id, &command, auth).await
    }

    /// Ask the instance to drop and re-establish its connection.
    pub async fn reconnect(
        &self,
        instance_id: &InstanceId,
        auth: &AuthContext,
    ) -> Result<CommandId, FleetProtocolError> {
        let command = HubCommand::Reconnect;
        self.send_no_wait(instance_id, command.command_type(), command.to_args()?, auth)
            .await
    }

    /// Commands answering with an [`ActionResult`]. A handler failure is
    /// folded into a failed result instead of an error.
    async fn action(
        &self,
        instance_id: &InstanceId,
        command: &HubCommand,
        auth: &AuthContext,
    ) -> Result<ActionResult, FleetProtocolError> {
        match self.execute::<ActionResult>(instance_id, command, auth).await {
            Ok(result) => Ok(result.unwrap_or_else(|| ActionResult::failure("No result returned"))),
            Err(FleetProtocolError::CommandFailed { message, .. }) => {
                Ok(ActionResult::failure(message))
            }
            Err(e) => Err(e),
        }
    }
}
