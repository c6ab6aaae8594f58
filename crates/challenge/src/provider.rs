//! Record provider boundary.
//!
//! Providers publish and withdraw the response record for a challenge. Real
//! DNS integrations live outside this crate; two built-in providers cover
//! in-process use and manual operation.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

use certfleet_common::ActionResult;

use crate::config::ChallengeMaterial;

/// Provider id of [`InMemoryRecordProvider`]
pub const IN_MEMORY_PROVIDER_ID: &str = "dns.memory";

/// Provider id of [`ManualRecordProvider`]
pub const MANUAL_PROVIDER_ID: &str = "dns.manual";

/// Record to create or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub record_name: String,
    pub record_value: String,
    /// Domain the challenge is for
    pub target_domain: String,
    pub credential_id: Option<String>,
    pub parameters: BTreeMap<String, String>,
}

impl DnsRecord {
    pub fn new(
        record_name: impl Into<String>,
        record_value: impl Into<String>,
        target_domain: impl Into<String>,
        material: &ChallengeMaterial,
    ) -> Self {
        Self {
            record_name: record_name.into(),
            record_value: record_value.into(),
            target_domain: target_domain.into(),
            credential_id: material.credential_id.clone(),
            parameters: material.parameters.clone(),
        }
    }
}

/// External record provider.
///
/// Outcomes use [`ActionResult`]: `awaiting_user` marks a record that a
/// human has to publish or remove.
#[async_trait]
pub trait RecordProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn create_record(&self, record: &DnsRecord) -> ActionResult;

    async fn delete_record(&self, record: &DnsRecord) -> ActionResult;
}

/// Registered providers, keyed by id.
#[derive(Clone, Default)]
pub struct RecordProviders {
    providers: HashMap<String, Arc<dyn RecordProvider>>,
}

impl RecordProviders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set with the built-in in-memory and manual providers.
    pub fn with_builtin() -> Self {
        let mut providers = Self::new();
        providers.register(Arc::new(InMemoryRecordProvider::new()));
        providers.register(Arc::new(ManualRecordProvider));
        providers
    }

    /// Register a provider, replacing any previous one with the same id.
    pub fn register(&mut self, provider: Arc<dyn RecordProvider>) {
        debug!(provider = %provider.id(), "Registered record provider");
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn RecordProvider>> {
        self.providers.get(id).cloned()
    }

    /// Registered ids in lexical order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for RecordProviders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordProviders")
            .field("providers", &self.ids())
            .finish()
    }
}

/// Keeps published records in memory.
///
/// A name may carry several values at once (an apex and a wildcard
/// authorization share `_acme-challenge.<domain>`).
#[derive(Debug, Default, Clone)]
pub struct InMemoryRecordProvider {
    records: Arc<DashMap<String, Vec<String>>>,
}

impl InMemoryRecordProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values currently published under `record_name`.
    pub fn values(&self, record_name: &str) -> Vec<String> {
        self.records
            .get(&record_name.to_lowercase())
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn record_count(&self) -> usize {
        self.records.iter().map(|entry| entry.value().len()).sum()
    }
}

#[async_trait]
impl RecordProvider for InMemoryRecordProvider {
    fn id(&self) -> &str {
        IN_MEMORY_PROVIDER_ID
    }

    async fn create_record(&self, record: &DnsRecord) -> ActionResult {
        let mut values = self
            .records
            .entry(record.record_name.to_lowercase())
            .or_default();
        if !values.contains(&record.record_value) {
            values.push(record.record_value.clone());
        }
        trace!(record = %record.record_name, "Published in-memory record");
        ActionResult::success(format!(
            "Created: {} :: {}",
            record.record_name, record.record_value
        ))
    }

    async fn delete_record(&self, record: &DnsRecord) -> ActionResult {
        let key = record.record_name.to_lowercase();
        if let Some(mut values) = self.records.get_mut(&key) {
            values.retain(|v| *v != record.record_value);
        }
        self.records.remove_if(&key, |_, values| values.is_empty());
        trace!(record = %record.record_name, "Withdrew in-memory record");
        ActionResult::success(format!(
            "Deleted: {} :: {}",
            record.record_name, record.record_value
        ))
    }
}

/// Asks an operator to manage the record by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualRecordProvider;

#[async_trait]
impl RecordProvider for ManualRecordProvider {
    fn id(&self) -> &str {
        MANUAL_PROVIDER_ID
    }

    async fn create_record(&self, record: &DnsRecord) -> ActionResult {
        ActionResult::awaiting_user(format!(
            "Please create a TXT record named {} with the value {} for {}",
            record.record_name, record.record_value, record.target_domain
        ))
    }

    async fn delete_record(&self, record: &DnsRecord) -> ActionResult {
        ActionResult::awaiting_user(format!(
            "Please remove the TXT record named {} with the value {}",
            record.record_name, record.record_value
        ))
    }
}
