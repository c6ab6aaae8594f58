//! Domain records carried as command arguments and results.
//!
//! The hub treats these as data passthrough: it only inspects managed items
//! (for the status cache) and otherwise hands them straight to its caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use certfleet_common::StatusSummary;

/// Health of a managed certificate as last evaluated by its instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemHealth {
    #[default]
    Unknown,
    Ok,
    Warning,
    Error,
    AwaitingUser,
}

/// A certificate managed by an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub health: ItemHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_expiry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_renewal_status: Option<String>,
    #[serde(default)]
    pub deployment_tasks: Vec<DeploymentTask>,
}

impl ManagedItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn has_certificate(&self) -> bool {
        self.certificate_path.is_some()
    }
}

/// Count items by health the same way instances report their summary.
pub fn summarize_items<'a>(items: impl IntoIterator<Item = &'a ManagedItem>) -> StatusSummary {
    let mut summary = StatusSummary::default();
    for item in items {
        summary.total += 1;
        match item.health {
            ItemHealth::Ok => summary.healthy += 1,
            ItemHealth::Warning => summary.warning += 1,
            ItemHealth::Error => summary.error += 1,
            ItemHealth::AwaitingUser => summary.awaiting_user += 1,
            ItemHealth::Unknown => {}
        }
        if !item.has_certificate() {
            summary.no_certificate += 1;
        }
    }
    summary
}

/// Full item list reported by one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedItemsSnapshot {
    pub instance_id: String,
    #[serde(default)]
    pub items: Vec<ManagedItem>,
}

/// A deployment step attached to a managed item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTask {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub provider_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogItem {
    pub event_date: DateTime<Utc>,
    #[serde(default)]
    pub level: String,
    pub message: String,
}

/// One step of a renewal preview or deployment run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStep {
    #[serde(default)]
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub has_error: bool,
    #[serde(default)]
    pub has_warning: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub substeps: Vec<ActionStep>,
}

/// Outcome line from a configuration test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub is_ok: bool,
    #[serde(default)]
    pub has_warning: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAuthority {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub production_api_endpoint: String,
    #[serde(default)]
    pub staging_api_endpoint: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub is_custom: bool,
}

fn default_true() -> bool {
    true
}

/// An ACME account registered on an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetails {
    pub storage_key: String,
    pub email: String,
    pub certificate_authority_id: String,
    #[serde(default)]
    pub is_staging_account: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_uri: Option<String>,
}

/// Request to register a new ACME account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRegistration {
    pub email_address: String,
    pub certificate_authority_id: String,
    #[serde(default)]
    pub agreed_to_terms_of_service: bool,
    #[serde(default)]
    pub is_staging: bool,
}

/// Credential used by challenge or deployment providers.
///
/// `secret` is only sent towards an instance; instances never return it.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredential {
    pub storage_key: String,
    pub title: String,
    pub provider_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl std::fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredential")
            .field("storage_key", &self.storage_key)
            .field("title", &self.title)
            .field("provider_type", &self.provider_type)
            .field("date_created", &self.date_created)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl StoredCredential {
    /// Copy without the secret value.
    pub fn redacted(&self) -> Self {
        Self {
            secret: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderParameter {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub is_credential: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeProviderDefinition {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub challenge_type: String,
    #[serde(default)]
    pub provider_parameters: Vec<ProviderParameter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsZone {
    pub zone_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentProviderDefinition {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_experimental: bool,
}
