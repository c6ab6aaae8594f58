//! Reference Certfleet instance.
//!
//! [`MemoryInstance`] keeps managed items, certificate authorities, ACME
//! accounts and stored credentials in memory and hands managed challenges to
//! a [`ChallengeWorkflow`]. It backs the `certfleet-instance` binary and is
//! the instance side of the end-to-end tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use certfleet_challenge::{
    ChallengeRequest, ChallengeWorkflow, InMemoryChallengeStore, ManagedChallengeConfig,
    ManagedChallengeStore, RecordProviders, CHALLENGE_TYPE_DNS, IN_MEMORY_PROVIDER_ID,
    MANUAL_PROVIDER_ID,
};
use certfleet_common::{ActionResult, InstanceId, StatusSummary};
use certfleet_config::InstanceConfig;
use certfleet_fleet_protocol::{
    summarize_items, AccountDetails, ActionStep, AgentCommandExecutor, CertificateAuthority,
    ChallengeProviderDefinition, ContactRegistration, DeploymentProviderDefinition, DnsZone,
    HubClient, HubClientConfig, InstanceHandler, InstanceInfo, LogItem, ManagedItem,
    ProviderParameter, StatusMessage, StoredCredential,
};

/// Deployment provider that only records the run in the item log.
pub const LOG_DEPLOYMENT_PROVIDER_ID: &str = "deploy.log";

/// Log entries kept per managed item
const MAX_LOG_ENTRIES: usize = 200;

/// In-memory instance state.
pub struct MemoryInstance {
    items: RwLock<BTreeMap<String, ManagedItem>>,
    authorities: RwLock<Vec<CertificateAuthority>>,
    accounts: RwLock<Vec<AccountDetails>>,
    credentials: RwLock<BTreeMap<String, StoredCredential>>,
    logs: RwLock<BTreeMap<String, Vec<LogItem>>>,
    challenges: ChallengeWorkflow,
}

impl Default for MemoryInstance {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInstance {
    pub fn new() -> Self {
        Self::with_challenge_store(Arc::new(InMemoryChallengeStore::new()))
    }

    /// Instance whose managed challenges live in `store`, fulfilled by the
    /// built-in record providers.
    pub fn with_challenge_store(store: Arc<dyn ManagedChallengeStore>) -> Self {
        Self::with_workflow(ChallengeWorkflow::new(store, RecordProviders::with_builtin()))
    }

    pub fn with_workflow(challenges: ChallengeWorkflow) -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            authorities: RwLock::new(Vec::new()),
            accounts: RwLock::new(Vec::new()),
            credentials: RwLock::new(BTreeMap::new()),
            logs: RwLock::new(BTreeMap::new()),
            challenges,
        }
    }

    pub fn with_items(self, items: impl IntoIterator<Item = ManagedItem>) -> Self {
        for item in items {
            self.insert_item(item);
        }
        self
    }

    pub fn insert_item(&self, item: ManagedItem) {
        self.items.write().insert(item.id.clone(), item);
    }

    pub fn item_count(&self) -> usize {
        self.items.read().len()
    }

    pub fn challenges(&self) -> &ChallengeWorkflow {
        &self.challenges
    }

    fn log(&self, item_id: &str, level: &str, message: impl Into<String>) {
        let mut logs = self.logs.write();
        let entries = logs.entry(item_id.to_string()).or_default();
        entries.push(LogItem {
            event_date: Utc::now(),
            level: level.to_string(),
            message: message.into(),
        });
        if entries.len() > MAX_LOG_ENTRIES {
            let excess = entries.len() - MAX_LOG_ENTRIES;
            entries.drain(..excess);
        }
    }

    fn require_item(&self, id: &str) -> anyhow::Result<ManagedItem> {
        self.items
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Managed item '{}' not found", id))
    }

    /// Describe how `domain` would be validated.
    async fn validation_step(&self, domain: &str) -> anyhow::Result<ActionStep> {
        let step = match self.challenges.resolve(domain).await? {
            Some(config) => ActionStep {
                key: domain.to_string(),
                title: format!("Validate {}", domain),
                description: format!(
                    "Managed challenge '{}' via {}",
                    config.title, config.challenge.provider
                ),
                ..Default::default()
            },
            None => ActionStep {
                key: domain.to_string(),
                title: format!("Validate {}", domain),
                description: "No managed challenge matches this name".to_string(),
                has_warning: true,
                ..Default::default()
            },
        };
        Ok(step)
    }
}

#[async_trait]
impl InstanceHandler for MemoryInstance {
    async fn get_managed_item(&self, id: &str) -> anyhow::Result<Option<ManagedItem>> {
        Ok(self.items.read().get(id).cloned())
    }

    async fn get_managed_items(&self) -> anyhow::Result<Vec<ManagedItem>> {
        Ok(self.items.read().values().cloned().collect())
    }

    async fn get_status_summary(&self) -> anyhow::Result<StatusSummary> {
        Ok(summarize_items(self.items.read().values()))
    }

    /// Newest entries first.
    async fn get_item_log(&self, id: &str, limit: u32) -> anyhow::Result<Vec<LogItem>> {
        let logs = self.logs.read();
        Ok(logs
            .get(id)
            .map(|entries| entries.iter().rev().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn preview_renewal(&self, item: &ManagedItem) -> anyhow::Result<Vec<ActionStep>> {
        let mut request = ActionStep {
            key: "request".to_string(),
            title: "Certificate Request".to_string(),
            description: format!("Request a certificate for {}", item.domains.join(", ")),
            ..Default::default()
        };
        if item.domains.is_empty() {
            request.description = "No domains are configured".to_string();
            request.has_error = true;
        }
        for domain in &item.domains {
            let step = self.validation_step(domain).await?;
            request.has_warning |= step.has_warning;
            request.substeps.push(step);
        }

        let mut steps = vec![request];
        steps.extend(item.deployment_tasks.iter().map(|task| ActionStep {
            key: task.id.clone(),
            title: format!("Deploy: {}", task.title),
            description: format!("Run deployment provider {}", task.provider_id),
            ..Default::default()
        }));
        Ok(steps)
    }

    async fn update_managed_item(&self, mut item: ManagedItem) -> anyhow::Result<Option<ManagedItem>> {
        if item.id.trim().is_empty() {
            item.id = Uuid::new_v4().to_string();
        }
        self.insert_item(item.clone());
        self.log(&item.id, "info", "Managed item updated");
        debug!(item_id = %item.id, "Stored managed item");
        Ok(Some(item))
    }

    async fn remove_managed_item(&self, id: &str) -> anyhow::Result<bool> {
        let removed = self.items.write().remove(id).is_some();
        if removed {
            self.logs.write().remove(id);
            info!(item_id = %id, "Removed managed item");
        }
        Ok(removed)
    }

    async fn test_configuration(&self, item: &ManagedItem) -> anyhow::Result<Vec<StatusMessage>> {
        if item.domains.is_empty() {
            return Ok(vec![StatusMessage {
                is_ok: false,
                has_warning: false,
                message: "At least one domain is required".to_string(),
            }]);
        }

        let mut messages = Vec::with_capacity(item.domains.len());
        for domain in &item.domains {
            let step = self.validation_step(domain).await?;
            messages.push(StatusMessage {
                is_ok: true,
                has_warning: step.has_warning,
                message: format!("{}: {}", domain, step.description),
            });
        }
        Ok(messages)
    }

    async fn perform_request(&self, id: &str) -> anyhow::Result<()> {
        {
            let mut items = self.items.write();
            let item = items
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("Managed item '{}' not found", id))?;
            item.last_renewal_status = Some("Requested".to_string());
        }
        self.log(id, "info", "Certificate request queued");
        info!(item_id = %id, "Certificate request queued");
        Ok(())
    }

    async fn get_certificate_authorities(&self) -> anyhow::Result<Vec<CertificateAuthority>> {
        Ok(self.authorities.read().clone())
    }

    async fn update_certificate_authority(
        &self,
        mut authority: CertificateAuthority,
    ) -> anyhow::Result<ActionResult> {
        if authority.production_api_endpoint.trim().is_empty() {
            return Ok(ActionResult::failure(
                "A production API endpoint is required",
            ));
        }
        if authority.id.trim().is_empty() {
            authority.id = Uuid::new_v4().to_string();
            authority.is_custom = true;
        }

        let message = format!("Certificate authority '{}' saved", authority.title);
        let mut authorities = self.authorities.write();
        match authorities.iter_mut().find(|existing| existing.id == authority.id) {
            Some(existing) => *existing = authority,
            None => authorities.push(authority),
        }
        Ok(ActionResult::success(message))
    }

    async fn remove_certificate_authority(&self, id: &str) -> anyhow::Result<ActionResult> {
        let mut authorities = self.authorities.write();
        let before = authorities.len();
        authorities.retain(|existing| existing.id != id);
        Ok(if authorities.len() != before {
            ActionResult::success(format!("Certificate authority '{}' removed", id))
        } else {
            ActionResult::failure(format!("Certificate authority '{}' not found", id))
        })
    }

    async fn get_acme_accounts(&self) -> anyhow::Result<Vec<AccountDetails>> {
        Ok(self.accounts.read().clone())
    }

    async fn add_acme_account(
        &self,
        registration: ContactRegistration,
    ) -> anyhow::Result<ActionResult> {
        if !registration.agreed_to_terms_of_service {
            return Ok(ActionResult::failure(
                "The certificate authority's terms of service must be accepted",
            ));
        }
        if registration.email_address.trim().is_empty() {
            return Ok(ActionResult::failure("An email address is required"));
        }

        let account = AccountDetails {
            storage_key: Uuid::new_v4().to_string(),
            email: registration.email_address,
            certificate_authority_id: registration.certificate_authority_id,
            is_staging_account: registration.is_staging,
            account_uri: None,
        };
        let message = format!("Added account {}", account.email);
        self.accounts.write().push(account);
        Ok(ActionResult::success(message))
    }

    async fn remove_acme_account(
        &self,
        storage_key: &str,
        deactivate: bool,
    ) -> anyhow::Result<ActionResult> {
        let mut accounts = self.accounts.write();
        let Some(index) = accounts.iter().position(|a| a.storage_key == storage_key) else {
            return Ok(ActionResult::failure(format!(
                "Account '{}' not found",
                storage_key
            )));
        };
        let account = accounts.remove(index);
        Ok(ActionResult::success(if deactivate {
            format!("Account {} deactivated and removed", account.email)
        } else {
            format!("Account {} removed", account.email)
        }))
    }

    async fn get_stored_credentials(&self) -> anyhow::Result<Vec<StoredCredential>> {
        Ok(self.credentials.read().values().cloned().collect())
    }

    async fn update_stored_credential(
        &self,
        mut credential: StoredCredential,
    ) -> anyhow::Result<ActionResult> {
        if credential.storage_key.trim().is_empty() {
            credential.storage_key = Uuid::new_v4().to_string();
        }
        credential.date_created.get_or_insert_with(Utc::now);

        let mut credentials = self.credentials.write();
        // An update without a secret keeps the stored one.
        if credential.secret.is_none() {
            if let Some(existing) = credentials.get(&credential.storage_key) {
                credential.secret = existing.secret.clone();
            }
        }
        let message = format!("Credential '{}' saved", credential.title);
        credentials.insert(credential.storage_key.clone(), credential);
        Ok(ActionResult::success(message))
    }

    async fn remove_stored_credential(&self, storage_key: &str) -> anyhow::Result<ActionResult> {
        Ok(match self.credentials.write().remove(storage_key) {
            Some(removed) => ActionResult::success(format!("Credential '{}' removed", removed.title)),
            None => ActionResult::failure(format!("Credential '{}' not found", storage_key)),
        })
    }

    async fn get_challenge_providers(&self) -> anyhow::Result<Vec<ChallengeProviderDefinition>> {
        Ok(self
            .challenges
            .providers()
            .ids()
            .into_iter()
            .map(|id| {
                let (title, description, provider_parameters) = match id.as_str() {
                    IN_MEMORY_PROVIDER_ID => (
                        "In-Memory DNS",
                        "Publishes records in process memory",
                        vec![ProviderParameter {
                            key: "zone".to_string(),
                            name: "Zone".to_string(),
                            is_required: false,
                            is_credential: false,
                        }],
                    ),
                    MANUAL_PROVIDER_ID => (
                        "Manual DNS",
                        "Asks an operator to manage the record",
                        Vec::new(),
                    ),
                    _ => ("", "", Vec::new()),
                };
                ChallengeProviderDefinition {
                    title: if title.is_empty() { id.clone() } else { title.to_string() },
                    id,
                    description: description.to_string(),
                    challenge_type: CHALLENGE_TYPE_DNS.to_string(),
                    provider_parameters,
                }
            })
            .collect())
    }

    /// Zones named by managed challenges using this provider and credential.
    async fn get_dns_zones(
        &self,
        provider_type_id: &str,
        credential_id: &str,
    ) -> anyhow::Result<Vec<DnsZone>> {
        let configs = self.challenges.store().list().await?;
        let mut zones: Vec<DnsZone> = Vec::new();
        for config in &configs {
            let material = &config.challenge;
            if material.provider != provider_type_id {
                continue;
            }
            if !credential_id.is_empty() && material.credential_id.as_deref() != Some(credential_id) {
                continue;
            }
            let Some(zone_id) = material.parameters.get("zone") else {
                continue;
            };
            if zones.iter().any(|z| &z.zone_id == zone_id) {
                continue;
            }
            let name = config
                .patterns()
                .into_iter()
                .find(|p| !p.starts_with("*."))
                .unwrap_or_else(|| zone_id.clone());
            zones.push(DnsZone {
                zone_id: zone_id.clone(),
                name,
            });
        }
        Ok(zones)
    }

    async fn get_deployment_providers(&self) -> anyhow::Result<Vec<DeploymentProviderDefinition>> {
        Ok(vec![DeploymentProviderDefinition {
            id: LOG_DEPLOYMENT_PROVIDER_ID.to_string(),
            title: "Log Deployment".to_string(),
            description: "Records the deployment in the item log".to_string(),
            is_experimental: false,
        }])
    }

    async fn execute_deployment_task(
        &self,
        item_id: &str,
        task_id: &str,
    ) -> anyhow::Result<Vec<ActionStep>> {
        let item = self.require_item(item_id)?;
        let task = item
            .deployment_tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| {
                anyhow::anyhow!("Deployment task '{}' not found on '{}'", task_id, item_id)
            })?;

        if task.provider_id != LOG_DEPLOYMENT_PROVIDER_ID {
            return Ok(vec![ActionStep {
                key: task.id.clone(),
                title: format!("Deploy: {}", task.title),
                description: format!("Unsupported deployment provider {}", task.provider_id),
                has_error: true,
                ..Default::default()
            }]);
        }

        self.log(item_id, "info", format!("Deployment task '{}' completed", task.title));
        Ok(vec![ActionStep {
            key: task.id.clone(),
            title: format!("Deploy: {}", task.title),
            description: "Deployment recorded".to_string(),
            ..Default::default()
        }])
    }

    async fn get_managed_challenges(&self) -> anyhow::Result<Vec<ManagedChallengeConfig>> {
        Ok(self.challenges.store().list().await?)
    }

    async fn update_managed_challenge(
        &self,
        config: ManagedChallengeConfig,
    ) -> anyhow::Result<ActionResult> {
        let stored = self.challenges.store().upsert(config).await?;
        Ok(ActionResult::success(format!(
            "Managed challenge '{}' saved",
            stored.id
        )))
    }

    async fn remove_managed_challenge(&self, id: &str) -> anyhow::Result<ActionResult> {
        Ok(if self.challenges.store().delete(id).await? {
            ActionResult::success(format!("Managed challenge '{}' removed", id))
        } else {
            ActionResult::failure(format!("Managed challenge '{}' not found", id))
        })
    }

    async fn perform_managed_challenge(
        &self,
        request: ChallengeRequest,
    ) -> anyhow::Result<ActionResult> {
        Ok(self.challenges.perform_create(&request).await)
    }

    async fn cleanup_managed_challenge(
        &self,
        request: ChallengeRequest,
    ) -> anyhow::Result<ActionResult> {
        Ok(self.challenges.perform_cleanup(&request).await)
    }
}

/// Client settings for an instance configuration.
pub fn client_config(config: &InstanceConfig) -> HubClientConfig {
    HubClientConfig {
        hub_address: config.hub_address.clone(),
        heartbeat_interval: config.heartbeat_interval(),
        reconnect_interval: config.reconnect_interval(),
        ..Default::default()
    }
}

/// Hub client serving `instance` under the configured identity.
pub fn build_client(config: &InstanceConfig, instance: Arc<MemoryInstance>) -> HubClient {
    let instance_id = InstanceId::new(config.instance_id.clone());
    HubClient::new(
        InstanceInfo::new(instance_id.clone()).with_title(config.title.clone()),
        AgentCommandExecutor::new(instance_id, instance),
        client_config(config),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use certfleet_challenge::ChallengeMaterial;
    use certfleet_fleet_protocol::{DeploymentTask, ItemHealth};

    fn item(id: &str, health: ItemHealth, domains: &[&str]) -> ManagedItem {
        ManagedItem {
            health,
            domains: domains.iter().map(|d| d.to_string()).collect(),
            certificate_path: Some(format!("/certs/{}.pfx", id)),
            ..ManagedItem::new(id, id)
        }
    }

    fn instance_with_challenge() -> MemoryInstance {
        let mut material = ChallengeMaterial::for_provider(IN_MEMORY_PROVIDER_ID);
        material.credential_id = Some("cred-01".to_string());
        material.parameters.insert("zone".to_string(), "Z123".to_string());
        let store = InMemoryChallengeStore::with_items(vec![
            ManagedChallengeConfig::new("example", "*.example.com;example.com")
                .with_challenge(material),
        ]);
        MemoryInstance::with_challenge_store(Arc::new(store))
    }

    #[tokio::test]
    async fn test_status_summary_counts_items() {
        let instance = MemoryInstance::new().with_items([
            item("a", ItemHealth::Ok, &["a.example.com"]),
            item("b", ItemHealth::Ok, &["b.example.com"]),
            item("c", ItemHealth::Error, &["c.example.com"]),
        ]);

        let summary = instance.get_status_summary().await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.healthy, 2);
        assert_eq!(summary.error, 1);
        assert_eq!(summary.no_certificate, 0);
    }

    #[tokio::test]
    async fn test_update_assigns_id_and_logs() {
        let instance = MemoryInstance::new();
        let stored = instance
            .update_managed_item(ManagedItem::new("", "New site"))
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.id.is_empty());
        assert_eq!(instance.item_count(), 1);

        instance.perform_request(&stored.id).await.unwrap();
        let log = instance.get_item_log(&stored.id, 10).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].message, "Certificate request queued");

        let latest = instance.get_item_log(&stored.id, 1).await.unwrap();
        assert_eq!(latest.len(), 1);

        assert!(instance.remove_managed_item(&stored.id).await.unwrap());
        assert!(!instance.remove_managed_item(&stored.id).await.unwrap());
        assert!(instance.get_item_log(&stored.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_for_unknown_item_fails() {
        let instance = MemoryInstance::new();
        let err = instance.perform_request("missing").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_preview_flags_unmatched_domains() {
        let instance = instance_with_challenge();
        let mut target = item("site", ItemHealth::Ok, &["www.example.com", "other.org"]);
        target.deployment_tasks.push(DeploymentTask {
            id: "t1".to_string(),
            title: "Reload".to_string(),
            provider_id: LOG_DEPLOYMENT_PROVIDER_ID.to_string(),
        });

        let steps = instance.preview_renewal(&target).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps[0].has_warning);
        assert_eq!(steps[0].substeps.len(), 2);
        assert!(!steps[0].substeps[0].has_warning);
        assert!(steps[0].substeps[1].has_warning);
        assert_eq!(steps[1].title, "Deploy: Reload");

        let empty = instance
            .preview_renewal(&ManagedItem::new("x", "x"))
            .await
            .unwrap();
        assert!(empty[0].has_error);
    }

    #[tokio::test]
    async fn test_deployment_task_runs_and_logs() {
        let instance = MemoryInstance::new();
        let mut target = item("site", ItemHealth::Ok, &["www.example.com"]);
        target.deployment_tasks.push(DeploymentTask {
            id: "t1".to_string(),
            title: "Reload".to_string(),
            provider_id: LOG_DEPLOYMENT_PROVIDER_ID.to_string(),
        });
        target.deployment_tasks.push(DeploymentTask {
            id: "t2".to_string(),
            title: "Upload".to_string(),
            provider_id: "deploy.ftp".to_string(),
        });
        instance.insert_item(target);

        let steps = instance.execute_deployment_task("site", "t1").await.unwrap();
        assert!(!steps[0].has_error);
        let steps = instance.execute_deployment_task("site", "t2").await.unwrap();
        assert!(steps[0].has_error);
        assert!(instance.execute_deployment_task("site", "t3").await.is_err());
        assert_eq!(instance.get_item_log("site", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_account_registration_requires_terms() {
        let instance = MemoryInstance::new();
        let mut registration = ContactRegistration {
            email_address: "admin@example.com".to_string(),
            certificate_authority_id: "letsencrypt.org".to_string(),
            ..Default::default()
        };
        assert!(!instance.add_acme_account(registration.clone()).await.unwrap().is_success);

        registration.agreed_to_terms_of_service = true;
        assert!(instance.add_acme_account(registration).await.unwrap().is_success);

        let accounts = instance.get_acme_accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        let removed = instance
            .remove_acme_account(&accounts[0].storage_key, true)
            .await
            .unwrap();
        assert!(removed.is_success);
        assert!(removed.message.contains("deactivated"));
        assert!(!instance.remove_acme_account("gone", false).await.unwrap().is_success);
    }

    #[tokio::test]
    async fn test_credential_update_keeps_secret() {
        let instance = MemoryInstance::new();
        let credential = StoredCredential {
            storage_key: "cred-01".to_string(),
            title: "DNS API".to_string(),
            provider_type: IN_MEMORY_PROVIDER_ID.to_string(),
            date_created: None,
            secret: Some("s3cret".to_string()),
        };
        instance.update_stored_credential(credential.clone()).await.unwrap();
        instance
            .update_stored_credential(StoredCredential {
                title: "DNS API (renamed)".to_string(),
                secret: None,
                ..credential
            })
            .await
            .unwrap();

        let stored = instance.get_stored_credentials().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title, "DNS API (renamed)");
        assert_eq!(stored[0].secret.as_deref(), Some("s3cret"));
        assert!(stored[0].date_created.is_some());
    }

    #[tokio::test]
    async fn test_certificate_authority_upsert() {
        let instance = MemoryInstance::new();
        let missing_endpoint = instance
            .update_certificate_authority(CertificateAuthority::default())
            .await
            .unwrap();
        assert!(!missing_endpoint.is_success);

        let saved = instance
            .update_certificate_authority(CertificateAuthority {
                title: "Private CA".to_string(),
                production_api_endpoint: "https://ca.internal/directory".to_string(),
                is_enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(saved.is_success);

        let authorities = instance.get_certificate_authorities().await.unwrap();
        assert_eq!(authorities.len(), 1);
        assert!(authorities[0].is_custom);
        let id = authorities[0].id.clone();
        assert!(instance.remove_certificate_authority(&id).await.unwrap().is_success);
        assert!(!instance.remove_certificate_authority(&id).await.unwrap().is_success);
    }

    #[tokio::test]
    async fn test_dns_zones_from_challenges() {
        let instance = instance_with_challenge();
        let zones = instance
            .get_dns_zones(IN_MEMORY_PROVIDER_ID, "cred-01")
            .await
            .unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].zone_id, "Z123");
        assert_eq!(zones[0].name, "example.com");

        assert!(instance
            .get_dns_zones(IN_MEMORY_PROVIDER_ID, "other")
            .await
            .unwrap()
            .is_empty());
        assert!(instance
            .get_dns_zones(MANUAL_PROVIDER_ID, "")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_challenge_providers_listed() {
        let providers = MemoryInstance::new().get_challenge_providers().await.unwrap();
        let ids: Vec<&str> = providers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![MANUAL_PROVIDER_ID, IN_MEMORY_PROVIDER_ID]);
        assert!(providers.iter().all(|p| p.challenge_type == CHALLENGE_TYPE_DNS));
    }

    #[tokio::test]
    async fn test_managed_challenge_crud() {
        let instance = MemoryInstance::new();
        let saved = instance
            .update_managed_challenge(
                ManagedChallengeConfig::new("", "example.org")
                    .with_challenge(ChallengeMaterial::for_provider(MANUAL_PROVIDER_ID)),
            )
            .await
            .unwrap();
        assert!(saved.is_success);

        let configs = instance.get_managed_challenges().await.unwrap();
        assert_eq!(configs.len(), 1);
        assert!(!configs[0].id.is_empty());

        let removed = instance.remove_managed_challenge(&configs[0].id).await.unwrap();
        assert!(removed.is_success);
        assert!(!instance.remove_managed_challenge("gone").await.unwrap().is_success);
    }

    #[test]
    fn test_client_config_from_instance_config() {
        let mut config = InstanceConfig::new("edge-01");
        config.hub_address = "hub.internal:7800".to_string();
        config.heartbeat_interval_secs = 12;

        let client = client_config(&config);
        assert_eq!(client.hub_address, "hub.internal:7800");
        assert_eq!(client.heartbeat_interval, std::time::Duration::from_secs(12));
        assert_eq!(client.reconnect_interval, std::time::Duration::from_secs(5));
    }
}
