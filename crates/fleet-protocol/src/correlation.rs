//! Correlation table.
//!
//! Maps an in-flight command id to a one-shot result slot. Each entry leaves
//! the table exactly once: when its result arrives, when its waiter times
//! out, or when the connection it was sent on goes away. Whichever happens
//! first wins; the others find the entry gone and do nothing.
//!
//! Entries remember the connection they were sent on, so replacing an
//! instance's connection only abandons commands sent over the old one.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use certfleet_common::{CommandId, InstanceId};

use crate::protocol::CommandResult;
use crate::FleetProtocolError;

/// How a pending correlation was settled.
#[derive(Debug)]
enum Resolution {
    Resolved(CommandResult),
    Abandoned(FleetProtocolError),
}

#[derive(Debug)]
struct PendingCorrelation {
    instance_id: InstanceId,
    connection_id: Uuid,
    created_at: DateTime<Utc>,
    sender: oneshot::Sender<Resolution>,
}

/// Waiting side of a registered correlation.
#[derive(Debug)]
pub struct PendingResult {
    command_id: CommandId,
    instance_id: InstanceId,
    receiver: oneshot::Receiver<Resolution>,
}

impl PendingResult {
    pub fn command_id(&self) -> CommandId {
        self.command_id
    }
}

/// Table of outstanding commands, keyed by command id.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: DashMap<CommandId, PendingCorrelation>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new command sent over `connection_id`.
    pub fn register(
        &self,
        command_id: CommandId,
        instance_id: &InstanceId,
        connection_id: Uuid,
    ) -> Result<PendingResult, FleetProtocolError> {
        match self.pending.entry(command_id) {
            Entry::Occupied(_) => {
                warn!(command_id = %command_id, "Duplicate correlation id");
                Err(FleetProtocolError::DuplicateCorrelation(command_id))
            }
            Entry::Vacant(slot) => {
                let (sender, receiver) = oneshot::channel();
                slot.insert(PendingCorrelation {
                    instance_id: instance_id.clone(),
                    connection_id,
                    created_at: Utc::now(),
                    sender,
                });
                trace!(command_id = %command_id, instance_id = %instance_id, "Registered correlation");
                Ok(PendingResult {
                    command_id,
                    instance_id: instance_id.clone(),
                    receiver,
                })
            }
        }
    }

    /// Deliver a result. Unknown or already settled ids are dropped.
    ///
    /// Returns whether a waiter was found.
    pub fn resolve(&self, result: CommandResult) -> bool {
        let command_id = result.command_id;
        match self.pending.remove(&command_id) {
            Some((_, pending)) => {
                // The waiter may have been dropped between removal and send.
                let delivered = pending.sender.send(Resolution::Resolved(result)).is_ok();
                trace!(command_id = %command_id, delivered, "Resolved correlation");
                delivered
            }
            None => {
                debug!(command_id = %command_id, "Dropping result for unknown or expired command");
                false
            }
        }
    }

    /// Stop tracking a command without waking its waiter.
    pub fn forget(&self, command_id: &CommandId) -> bool {
        self.pending.remove(command_id).is_some()
    }

    /// Wait for the result of `pending`.
    ///
    /// A result that arrives before the deadline is returned. At the
    /// deadline the entry is removed and any later result is dropped.
    pub async fn await_result(
        &self,
        pending: PendingResult,
        timeout: Duration,
    ) -> Result<CommandResult, FleetProtocolError> {
        let PendingResult {
            command_id,
            instance_id,
            mut receiver,
        } = pending;

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(resolution)) => into_result(resolution),
            // Sender dropped without settling.
            Ok(Err(_)) => Err(FleetProtocolError::AgentDisconnected(instance_id)),
            Err(_) => {
                if self.pending.remove(&command_id).is_some() {
                    debug!(command_id = %command_id, timeout = ?timeout, "Command timed out");
                    return Err(FleetProtocolError::CommandTimedOut {
                        command_id,
                        timeout,
                    });
                }
                // Another path settled the entry; take its outcome.
                match receiver.try_recv() {
                    Ok(resolution) => into_result(resolution),
                    Err(_) => Err(FleetProtocolError::CommandTimedOut {
                        command_id,
                        timeout,
                    }),
                }
            }
        }
    }

    /// Release every waiter for `instance_id` with `AgentDisconnected`.
    ///
    /// Returns the number of commands abandoned.
    pub fn abandon_instance(&self, instance_id: &InstanceId) -> usize {
        let abandoned = self.abandon_where(|pending| pending.instance_id == *instance_id);
        if abandoned > 0 {
            debug!(instance_id = %instance_id, abandoned, "Abandoned outstanding commands");
        }
        abandoned
    }

    /// Release every waiter whose command went out over `connection_id`.
    ///
    /// Commands sent over a newer connection for the same instance are left
    /// alone.
    pub fn abandon_connection(&self, connection_id: Uuid) -> usize {
        let abandoned = self.abandon_where(|pending| pending.connection_id == connection_id);
        if abandoned > 0 {
            debug!(connection_id = %connection_id, abandoned, "Abandoned commands of closed connection");
        }
        abandoned
    }

    /// Remove entries older than `max_age`, typically left behind by callers
    /// that were cancelled mid-wait. Any waiter still listening gets
    /// `AgentDisconnected`.
    pub fn purge_stale(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let cutoff = Utc::now() - max_age;
        let purged = self.abandon_where(|pending| pending.created_at <= cutoff);
        if purged > 0 {
            warn!(purged, "Purged stale correlations");
        }
        purged
    }

    fn abandon_where<F>(&self, matches: F) -> usize
    where
        F: Fn(&PendingCorrelation) -> bool,
    {
        let ids: Vec<CommandId> = self
            .pending
            .iter()
            .filter(|entry| matches(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut abandoned = 0;
        for command_id in ids {
            // Settled concurrently if the entry is already gone.
            if let Some((_, pending)) = self.pending.remove(&command_id) {
                let _ = pending.sender.send(Resolution::Abandoned(
                    FleetProtocolError::AgentDisconnected(pending.instance_id.clone()),
                ));
                abandoned += 1;
            }
        }
        abandoned
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_for(&self, instance_id: &InstanceId) -> usize {
        self.pending
            .iter()
            .filter(|entry| entry.value().instance_id == *instance_id)
            .count()
    }
}

fn into_result(resolution: Resolution) -> Result<CommandResult, FleetProtocolError> {
    match resolution {
        Resolution::Resolved(result) => Ok(result),
        Resolution::Abandoned(err) => Err(err),
    }
}
