//! Managed challenge configuration store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::config::ManagedChallengeConfig;
use crate::errors::ChallengeError;

/// Storage for managed challenge configurations.
#[async_trait]
pub trait ManagedChallengeStore: Send + Sync {
    async fn list(&self) -> Result<Vec<ManagedChallengeConfig>, ChallengeError>;

    /// Insert or replace by id. An empty id is assigned a fresh one.
    async fn upsert(
        &self,
        config: ManagedChallengeConfig,
    ) -> Result<ManagedChallengeConfig, ChallengeError>;

    /// Returns whether an item was removed.
    async fn delete(&self, id: &str) -> Result<bool, ChallengeError>;
}

/// Insertion-ordered in-memory store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryChallengeStore {
    items: Arc<RwLock<Vec<ManagedChallengeConfig>>>,
}

impl InMemoryChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<ManagedChallengeConfig>) -> Self {
        Self {
            items: Arc::new(RwLock::new(items)),
        }
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

#[async_trait]
impl ManagedChallengeStore for InMemoryChallengeStore {
    async fn list(&self) -> Result<Vec<ManagedChallengeConfig>, ChallengeError> {
        Ok(self.items.read().clone())
    }

    async fn upsert(
        &self,
        mut config: ManagedChallengeConfig,
    ) -> Result<ManagedChallengeConfig, ChallengeError> {
        if config.id.trim().is_empty() {
            config.id = Uuid::new_v4().to_string();
        }

        let mut items = self.items.write();
        match items.iter_mut().find(|existing| existing.id == config.id) {
            Some(existing) => *existing = config.clone(),
            None => items.push(config.clone()),
        }
        debug!(challenge_id = %config.id, "Stored managed challenge");
        Ok(config)
    }

    async fn delete(&self, id: &str) -> Result<bool, ChallengeError> {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|existing| existing.id != id);
        let removed = items.len() != before;
        if removed {
            debug!(challenge_id = %id, "Removed managed challenge");
        }
        Ok(removed)
    }
}
