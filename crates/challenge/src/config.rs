//! Managed challenge configuration and inbound challenge requests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Default challenge type for managed challenges
pub const CHALLENGE_TYPE_DNS: &str = "dns-01";

/// A pre-configured challenge responder.
///
/// `domain_match` is a `;` or `,` delimited list of names and `*.` wildcards.
/// An empty list makes the configuration a catch-all. Several configurations
/// may claim the same pattern; the matcher decides which one wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedChallengeConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub domain_match: String,
    #[serde(default)]
    pub challenge: ChallengeMaterial,
}

impl ManagedChallengeConfig {
    pub fn new(id: impl Into<String>, domain_match: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain_match: domain_match.into(),
            ..Default::default()
        }
    }

    pub fn with_challenge(mut self, challenge: ChallengeMaterial) -> Self {
        self.challenge = challenge;
        self
    }

    /// Normalized patterns, in declaration order.
    ///
    /// Commas are treated as semicolons; entries are trimmed and lower-cased,
    /// blank entries dropped.
    pub fn patterns(&self) -> Vec<String> {
        self.domain_match
            .replace(',', ";")
            .split(';')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect()
    }

    /// Only a literally empty `domain_match` is a catch-all. A blank one
    /// has no patterns and matches nothing.
    pub fn is_catch_all(&self) -> bool {
        self.domain_match.is_empty()
    }
}

/// How a response record is produced for a matched challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeMaterial {
    #[serde(default = "default_challenge_type")]
    pub challenge_type: String,
    /// Record provider id, e.g. `dns.memory`
    #[serde(default)]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

fn default_challenge_type() -> String {
    CHALLENGE_TYPE_DNS.to_string()
}

impl Default for ChallengeMaterial {
    fn default() -> Self {
        Self {
            challenge_type: default_challenge_type(),
            provider: String::new(),
            credential_id: None,
            parameters: BTreeMap::new(),
        }
    }
}

impl ChallengeMaterial {
    pub fn for_provider(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }
}

/// One validation attempt delegated to a managed challenge.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    #[serde(default = "default_challenge_type")]
    pub challenge_type: String,
    /// Name being validated
    pub identifier: String,
    /// Record name, e.g. `_acme-challenge.example.com`
    pub response_key: String,
    pub response_value: String,
    #[serde(default)]
    pub auth_key: String,
    #[serde(default)]
    pub auth_secret: String,
}

impl ChallengeRequest {
    pub fn dns(
        identifier: impl Into<String>,
        response_key: impl Into<String>,
        response_value: impl Into<String>,
    ) -> Self {
        Self {
            challenge_type: CHALLENGE_TYPE_DNS.to_string(),
            identifier: identifier.into(),
            response_key: response_key.into(),
            response_value: response_value.into(),
            auth_key: String::new(),
            auth_secret: String::new(),
        }
    }
}

impl fmt::Debug for ChallengeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeRequest")
            .field("challenge_type", &self.challenge_type)
            .field("identifier", &self.identifier)
            .field("response_key", &self.response_key)
            .field("response_value", &self.response_value)
            .field("auth_key", &self.auth_key)
            .field("auth_secret", &"<redacted>")
            .finish()
    }
}
