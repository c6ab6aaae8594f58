//! Connection registry.
//!
//! Tracks the live connection of every instance plus a cached snapshot of
//! what the instance last reported. Live entries are removed on disconnect;
//! snapshots are kept so status can still be displayed for offline
//! instances.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

use certfleet_common::{InstanceId, StatusSummary};

use crate::frame::HubMessage;
use crate::models::{summarize_items, ManagedItem};
use crate::protocol::InstanceInfo;
use crate::FleetProtocolError;

/// Sending side of one transport connection.
///
/// Cloning is cheap; all clones address the same connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: Uuid,
    outbound: mpsc::Sender<HubMessage>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(outbound: mpsc::Sender<HubMessage>, shutdown: CancellationToken) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            outbound,
            shutdown,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Queue a message for the connection's writer task.
    pub async fn send(&self, message: HubMessage) -> Result<(), FleetProtocolError> {
        if self.shutdown.is_cancelled() {
            return Err(FleetProtocolError::ConnectionClosed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| FleetProtocolError::ConnectionClosed)
    }

    /// Ask the connection to shut down.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.outbound.is_closed()
    }
}

/// A live instance connection.
#[derive(Debug, Clone)]
pub struct AgentConnection {
    pub instance_id: InstanceId,
    pub info: InstanceInfo,
    pub handle: ConnectionHandle,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    last_seen: Instant,
}

impl AgentConnection {
    /// Time since the last heartbeat (or connect).
    pub fn silence(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

/// Last known state of an instance, kept across disconnects.
#[derive(Debug, Clone, Default)]
pub struct InstanceSnapshot {
    pub info: Option<InstanceInfo>,
    pub summary: Option<StatusSummary>,
    /// Full item list, once one has been fetched
    pub items: Option<Vec<ManagedItem>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub connected: bool,
}

impl InstanceSnapshot {
    fn refresh_summary(&mut self, instance_id: &InstanceId) {
        if let Some(items) = &self.items {
            let mut summary = summarize_items(items);
            summary.instance_id = Some(instance_id.to_string());
            self.summary = Some(summary);
        }
    }
}

/// Registry of instance connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<InstanceId, AgentConnection>,
    snapshots: DashMap<InstanceId, InstanceSnapshot>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection for `info.instance_id`.
    ///
    /// Replaces any previous connection for the same instance and returns its
    /// handle so the caller can close it. Only the cached snapshot carries
    /// over.
    pub fn on_connect(
        &self,
        info: InstanceInfo,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let instance_id = info.instance_id.clone();
        let now = Utc::now();

        {
            let mut snapshot = self.snapshots.entry(instance_id.clone()).or_default();
            snapshot.info = Some(info.clone());
            snapshot.connected = true;
            snapshot.last_heartbeat = Some(now);
        }

        let previous = self.connections.insert(
            instance_id.clone(),
            AgentConnection {
                instance_id: instance_id.clone(),
                info,
                handle,
                connected_at: now,
                last_heartbeat: now,
                last_seen: Instant::now(),
            },
        );

        info!(
            instance_id = %instance_id,
            replaced = previous.is_some(),
            "Instance connected"
        );
        previous.map(|conn| conn.handle)
    }

    /// Remove the live connection for an instance.
    pub fn on_disconnect(&self, instance_id: &InstanceId) -> Option<AgentConnection> {
        let removed = self.connections.remove(instance_id).map(|(_, conn)| conn);
        if removed.is_some() {
            self.mark_offline(instance_id);
            info!(instance_id = %instance_id, "Instance disconnected");
        }
        removed
    }

    /// Remove the entry only if it still belongs to `connection_id`.
    ///
    /// A connection that was replaced by a reconnect must not evict its
    /// successor when it finally closes.
    pub fn on_connection_closed(&self, instance_id: &InstanceId, connection_id: Uuid) -> bool {
        let removed = self
            .connections
            .remove_if(instance_id, |_, conn| conn.handle.connection_id() == connection_id)
            .is_some();
        if removed {
            self.mark_offline(instance_id);
            info!(instance_id = %instance_id, "Instance connection closed");
        } else {
            debug!(
                instance_id = %instance_id,
                connection_id = %connection_id,
                "Closed connection was already replaced"
            );
        }
        removed
    }

    fn mark_offline(&self, instance_id: &InstanceId) {
        if let Some(mut snapshot) = self.snapshots.get_mut(instance_id) {
            snapshot.connected = false;
        }
    }

    pub fn lookup(&self, instance_id: &InstanceId) -> Option<ConnectionHandle> {
        self.connections
            .get(instance_id)
            .map(|conn| conn.handle.clone())
    }

    pub fn connection(&self, instance_id: &InstanceId) -> Option<AgentConnection> {
        self.connections.get(instance_id).map(|conn| conn.clone())
    }

    pub fn is_connected(&self, instance_id: &InstanceId) -> bool {
        self.connections.contains_key(instance_id)
    }

    /// Record liveness, optionally with a fresh status summary.
    ///
    /// Returns false if the instance has no live connection.
    pub fn record_heartbeat(
        &self,
        instance_id: &InstanceId,
        summary: Option<StatusSummary>,
    ) -> bool {
        let now = Utc::now();
        let Some(mut conn) = self.connections.get_mut(instance_id) else {
            return false;
        };
        conn.last_heartbeat = now;
        conn.last_seen = Instant::now();
        drop(conn);

        let mut snapshot = self.snapshots.entry(instance_id.clone()).or_default();
        snapshot.last_heartbeat = Some(now);
        if let Some(summary) = summary {
            snapshot.summary = Some(summary);
        }
        trace!(instance_id = %instance_id, "Heartbeat recorded");
        true
    }

    pub fn update_cached_summary(&self, instance_id: &InstanceId, summary: StatusSummary) {
        self.snapshots
            .entry(instance_id.clone())
            .or_default()
            .summary = Some(summary);
    }

    /// Replace the cached item list and recompute the summary from it.
    pub fn replace_cached_items(&self, instance_id: &InstanceId, items: Vec<ManagedItem>) {
        let mut snapshot = self.snapshots.entry(instance_id.clone()).or_default();
        snapshot.items = Some(items);
        snapshot.refresh_summary(instance_id);
    }

    /// Insert or replace one cached item.
    pub fn update_cached_item(&self, instance_id: &InstanceId, item: ManagedItem) {
        let mut snapshot = self.snapshots.entry(instance_id.clone()).or_default();
        let items = snapshot.items.get_or_insert_with(Vec::new);
        match items.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item,
            None => items.push(item),
        }
        snapshot.refresh_summary(instance_id);
    }

    /// Drop one cached item. Returns whether it was present.
    pub fn evict_cached_item(&self, instance_id: &InstanceId, item_id: &str) -> bool {
        let Some(mut snapshot) = self.snapshots.get_mut(instance_id) else {
            return false;
        };
        let Some(items) = snapshot.items.as_mut() else {
            return false;
        };
        let before = items.len();
        items.retain(|item| item.id != item_id);
        let evicted = items.len() != before;
        if evicted {
            snapshot.refresh_summary(instance_id);
        }
        evicted
    }

    pub fn snapshot(&self, instance_id: &InstanceId) -> Option<InstanceSnapshot> {
        self.snapshots.get(instance_id).map(|s| s.clone())
    }

    /// Cached summaries of every instance ever seen.
    pub fn summaries(&self) -> Vec<(InstanceId, Option<StatusSummary>)> {
        self.snapshots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().summary.clone()))
            .collect()
    }

    /// Instances silent for longer than `threshold`.
    pub fn stale_instances(&self, threshold: Duration) -> Vec<InstanceId> {
        self.connections
            .iter()
            .filter(|entry| entry.value().silence() > threshold)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn connected_instances(&self) -> Vec<InstanceInfo> {
        let mut infos: Vec<InstanceInfo> = self
            .connections
            .iter()
            .map(|entry| entry.value().info.clone())
            .collect();
        infos.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        infos
    }

    pub fn connected_count(&self) -> usize {
        self.connections.len()
    }
}
