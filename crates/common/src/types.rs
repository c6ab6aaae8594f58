//! Shared result envelopes and status types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Uniform outcome envelope returned by challenge workflows and instance commands.
///
/// `awaiting_user` distinguishes "a human has to act" from a plain failure so
/// callers can prompt instead of showing an error, and must not retry
/// automatically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub is_success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub awaiting_user: bool,
}

impl ActionResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            is_success: true,
            message: message.into(),
            awaiting_user: false,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            is_success: false,
            message: message.into(),
            awaiting_user: false,
        }
    }

    /// A non-success outcome that requires out-of-band human action.
    pub fn awaiting_user(message: impl Into<String>) -> Self {
        Self {
            is_success: false,
            message: message.into(),
            awaiting_user: true,
        }
    }
}

impl fmt::Display for ActionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_success {
            "ok"
        } else if self.awaiting_user {
            "awaiting user"
        } else {
            "failed"
        };
        write!(f, "[{}] {}", state, self.message)
    }
}

/// Per-instance counts of managed items by health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub healthy: u32,
    #[serde(default)]
    pub error: u32,
    #[serde(default)]
    pub warning: u32,
    #[serde(default)]
    pub awaiting_user: u32,
    #[serde(default)]
    pub no_certificate: u32,
}

impl StatusSummary {
    /// Add another summary's counts into this one.
    pub fn accumulate(&mut self, other: &StatusSummary) {
        self.total += other.total;
        self.healthy += other.healthy;
        self.error += other.error;
        self.warning += other.warning;
        self.awaiting_user += other.awaiting_user;
        self.no_certificate += other.no_certificate;
    }
}

/// Authorization context carried with every dispatched command.
///
/// Policy has already been evaluated by the access-control engine before a
/// command reaches the dispatcher; the context only travels along for auditing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AuthContext {
    pub fn for_principal(principal_id: impl Into<String>) -> Self {
        Self {
            principal_id: Some(principal_id.into()),
            session_id: None,
        }
    }

    /// Context for hub-internal calls (sweeps, cache refreshes).
    pub fn system() -> Self {
        Self::for_principal("system")
    }

    pub fn principal(&self) -> &str {
        self.principal_id.as_deref().unwrap_or("anonymous")
    }
}
