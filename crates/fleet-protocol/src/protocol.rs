//! Fleet protocol types and constants.
//!
//! This module defines the messages exchanged between the hub and its managed
//! instances: the command envelope (hub -> instance), the command result
//! (instance -> hub), and the handshake and heartbeat messages that travel on
//! the same connection independently of any command.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use certfleet_common::{CommandId, InstanceId, StatusSummary};

use crate::FleetProtocolError;

/// Fleet protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Command type tag.
///
/// The set of known tags is versioned with the protocol. Tags this build does
/// not know are preserved as [`CommandType::Other`] so that an instance can
/// answer them with an empty result instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandType {
    GetManagedItem,
    GetManagedItems,
    GetStatusSummary,
    GetManagedItemLog,
    GetManagedItemRenewalPreview,
    UpdateManagedItem,
    RemoveManagedItem,
    TestManagedItemConfiguration,
    PerformManagedItemRequest,
    GetCertificateAuthorities,
    UpdateCertificateAuthority,
    RemoveCertificateAuthority,
    GetAcmeAccounts,
    AddAcmeAccount,
    RemoveAcmeAccount,
    GetStoredCredentials,
    UpdateStoredCredential,
    RemoveStoredCredential,
    GetChallengeProviders,
    GetDnsZones,
    GetDeploymentProviders,
    ExecuteDeploymentTask,
    GetManagedChallenges,
    UpdateManagedChallenge,
    RemoveManagedChallenge,
    PerformManagedChallenge,
    CleanupManagedChallenge,
    Reconnect,
    /// A tag not known to this build
    Other(String),
}

impl CommandType {
    /// Every known command type, in wire-table order.
    pub const KNOWN: [CommandType; 28] = [
        CommandType::GetManagedItem,
        CommandType::GetManagedItems,
        CommandType::GetStatusSummary,
        CommandType::GetManagedItemLog,
        CommandType::GetManagedItemRenewalPreview,
        CommandType::UpdateManagedItem,
        CommandType::RemoveManagedItem,
        CommandType::TestManagedItemConfiguration,
        CommandType::PerformManagedItemRequest,
        CommandType::GetCertificateAuthorities,
        CommandType::UpdateCertificateAuthority,
        CommandType::RemoveCertificateAuthority,
        CommandType::GetAcmeAccounts,
        CommandType::AddAcmeAccount,
        CommandType::RemoveAcmeAccount,
        CommandType::GetStoredCredentials,
        CommandType::UpdateStoredCredential,
        CommandType::RemoveStoredCredential,
        CommandType::GetChallengeProviders,
        CommandType::GetDnsZones,
        CommandType::GetDeploymentProviders,
        CommandType::ExecuteDeploymentTask,
        CommandType::GetManagedChallenges,
        CommandType::UpdateManagedChallenge,
        CommandType::RemoveManagedChallenge,
        CommandType::PerformManagedChallenge,
        CommandType::CleanupManagedChallenge,
        CommandType::Reconnect,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            CommandType::GetManagedItem => "GetManagedItem",
            CommandType::GetManagedItems => "GetManagedItems",
            CommandType::GetStatusSummary => "GetStatusSummary",
            CommandType::GetManagedItemLog => "GetManagedItemLog",
            CommandType::GetManagedItemRenewalPreview => "GetManagedItemRenewalPreview",
            CommandType::UpdateManagedItem => "UpdateManagedItem",
            CommandType::RemoveManagedItem => "RemoveManagedItem",
            CommandType::TestManagedItemConfiguration => "TestManagedItemConfiguration",
            CommandType::PerformManagedItemRequest => "PerformManagedItemRequest",
            CommandType::GetCertificateAuthorities => "GetCertificateAuthorities",
            CommandType::UpdateCertificateAuthority => "UpdateCertificateAuthority",
            CommandType::RemoveCertificateAuthority => "RemoveCertificateAuthority",
            CommandType::GetAcmeAccounts => "GetAcmeAccounts",
            CommandType::AddAcmeAccount => "AddAcmeAccount",
            CommandType::RemoveAcmeAccount => "RemoveAcmeAccount",
            CommandType::GetStoredCredentials => "GetStoredCredentials",
            CommandType::UpdateStoredCredential => "UpdateStoredCredential",
            CommandType::RemoveStoredCredential => "RemoveStoredCredential",
            CommandType::GetChallengeProviders => "GetChallengeProviders",
            CommandType::GetDnsZones => "GetDnsZones",
            CommandType::GetDeploymentProviders => "GetDeploymentProviders",
            CommandType::ExecuteDeploymentTask => "ExecuteDeploymentTask",
            CommandType::GetManagedChallenges => "GetManagedChallenges",
            CommandType::UpdateManagedChallenge => "UpdateManagedChallenge",
            CommandType::RemoveManagedChallenge => "RemoveManagedChallenge",
            CommandType::PerformManagedChallenge => "PerformManagedChallenge",
            CommandType::CleanupManagedChallenge => "CleanupManagedChallenge",
            CommandType::Reconnect => "Reconnect",
            CommandType::Other(tag) => tag,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, CommandType::Other(_))
    }
}

impl From<String> for CommandType {
    fn from(tag: String) -> Self {
        CommandType::KNOWN
            .iter()
            .find(|known| known.as_str() == tag)
            .cloned()
            .unwrap_or(CommandType::Other(tag))
    }
}

impl From<&str> for CommandType {
    fn from(tag: &str) -> Self {
        CommandType::from(tag.to_string())
    }
}

impl From<CommandType> for String {
    fn from(command_type: CommandType) -> Self {
        match command_type {
            CommandType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single named command argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandArg {
    pub key: String,
    pub value: String,
}

/// Flat, ordered set of string-keyed command arguments.
///
/// Serialized as a JSON list of `{"key", "value"}` pairs. Structured
/// arguments are nested as JSON strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandArgs(Vec<CommandArg>);

impl CommandArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an argument (builder style).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push(CommandArg {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Append a structured argument as a nested JSON string.
    pub fn with_json<T: Serialize>(
        self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, FleetProtocolError> {
        let encoded = serde_json::to_string(value)
            .map_err(|e| FleetProtocolError::Serialization(e.to_string()))?;
        Ok(self.with(key, encoded))
    }

    /// Append every argument of `other`.
    pub fn extend(mut self, other: CommandArgs) -> Self {
        self.0.extend(other.0);
        self
    }

    /// First value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|arg| arg.key == key)
            .map(|arg| arg.value.as_str())
    }

    pub fn required(&self, key: &str) -> Result<&str, FleetProtocolError> {
        self.get(key)
            .ok_or_else(|| FleetProtocolError::MissingArgument(key.to_string()))
    }

    /// Decode a nested JSON argument.
    pub fn parse_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, FleetProtocolError> {
        let raw = self.required(key)?;
        serde_json::from_str(raw).map_err(|e| FleetProtocolError::InvalidArgument {
            name: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Parse a scalar argument with [`std::str::FromStr`].
    pub fn parse<T>(&self, key: &str) -> Result<T, FleetProtocolError>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.required(key)?;
        raw.trim()
            .parse()
            .map_err(|e: T::Err| FleetProtocolError::InvalidArgument {
                name: key.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandArg> {
        self.0.iter()
    }

    /// Encode as an envelope payload string.
    pub fn encode(&self) -> Result<String, FleetProtocolError> {
        serde_json::to_string(&self.0).map_err(|e| FleetProtocolError::Serialization(e.to_string()))
    }

    /// Decode an envelope payload. An absent or blank payload means no arguments.
    pub fn decode(payload: Option<&str>) -> Result<Self, FleetProtocolError> {
        match payload.map(str::trim) {
            None | Some("") | Some("null") => Ok(Self::default()),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| FleetProtocolError::InvalidMessage(format!("Bad command payload: {}", e))),
        }
    }
}

/// Command sent from the hub to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub command_id: CommandId,
    pub command_type: CommandType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl CommandEnvelope {
    /// Build an envelope with a freshly generated command id.
    pub fn new(command_type: CommandType, args: &CommandArgs) -> Result<Self, FleetProtocolError> {
        let payload = if args.is_empty() {
            None
        } else {
            Some(args.encode()?)
        };
        Ok(Self {
            command_id: CommandId::new(),
            command_type,
            payload,
        })
    }

    pub fn args(&self) -> Result<CommandArgs, FleetProtocolError> {
        CommandArgs::decode(self.payload.as_deref())
    }
}

/// Result returned by an instance for one command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command_id: CommandId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    /// JSON encoding of the handler's return value. Absent for unknown
    /// commands and commands that return nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Handler failure message, when the command failed on the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Decoded value, only set when the executor runs in the same process
    #[serde(skip)]
    pub materialized: Option<serde_json::Value>,
}

impl CommandResult {
    pub fn empty(command_id: CommandId) -> Self {
        Self {
            command_id,
            ..Default::default()
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    /// Decode the payload into `T`. `None` when the payload is absent.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, FleetProtocolError> {
        if let Some(value) = &self.materialized {
            return serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| FleetProtocolError::Serialization(e.to_string()));
        }
        match self.payload.as_deref() {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| FleetProtocolError::Serialization(e.to_string())),
        }
    }
}

/// Identity and build information sent by an instance as its first frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub instance_id: InstanceId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub client_version: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

impl InstanceInfo {
    pub fn new(instance_id: impl Into<InstanceId>) -> Self {
        Self {
            instance_id: instance_id.into(),
            title: String::new(),
            os: std::env::consts::OS.to_string(),
            os_version: String::new(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            client_name: "certfleet".to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// Hub reply to [`InstanceInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    pub accepted: bool,
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Periodic liveness message from an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub instance_id: InstanceId,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<StatusSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_type_wire_strings() {
        for known in CommandType::KNOWN.iter() {
            let json = serde_json::to_string(known).unwrap();
            assert_eq!(json, format!("\"{}\"", known.as_str()));
            let back: CommandType = serde_json::from_str(&json).unwrap();
            assert_eq!(&back, known);
        }
    }

    #[test]
    fn test_unknown_command_type_is_preserved() {
        let parsed: CommandType = serde_json::from_str("\"RotateEverything\"").unwrap();
        assert_eq!(parsed, CommandType::Other("RotateEverything".to_string()));
        assert!(!parsed.is_known());
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"RotateEverything\"");
    }

    #[test]
    fn test_args_payload_shape() {
        let args = CommandArgs::new()
            .with("instanceId", "edge-01")
            .with("managedCertId", "abc");
        let encoded = args.encode().unwrap();
        assert_eq!(
            encoded,
            r#"[{"key":"instanceId","value":"edge-01"},{"key":"managedCertId","value":"abc"}]"#
        );
        let decoded = CommandArgs::decode(Some(&encoded)).unwrap();
        assert_eq!(decoded.get("managedCertId"), Some("abc"));
    }

    #[test]
    fn test_args_empty_payload() {
        assert!(CommandArgs::decode(None).unwrap().is_empty());
        assert!(CommandArgs::decode(Some("  ")).unwrap().is_empty());
        assert!(CommandArgs::decode(Some("{oops")).is_err());
    }

    #[test]
    fn test_args_errors_name_the_argument() {
        let args = CommandArgs::new().with("limit", "ten");
        match args.required("managedCertId") {
            Err(FleetProtocolError::MissingArgument(name)) => assert_eq!(name, "managedCertId"),
            other => panic!("unexpected: {:?}", other),
        }
        match args.parse::<u32>("limit") {
            Err(FleetProtocolError::InvalidArgument { name, .. }) => assert_eq!(name, "limit"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_envelope_without_args_has_no_payload() {
        let envelope = CommandEnvelope::new(CommandType::GetStatusSummary, &CommandArgs::new()).unwrap();
        assert!(envelope.payload.is_none());
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["commandType"], "GetStatusSummary");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_result_decode_prefers_materialized() {
        let mut result = CommandResult::empty(CommandId::new());
        assert_eq!(result.decode::<bool>().unwrap(), None);

        result.payload = Some("false".to_string());
        result.materialized = Some(serde_json::Value::Bool(true));
        assert_eq!(result.decode::<bool>().unwrap(), Some(true));

        result.materialized = None;
        assert_eq!(result.decode::<bool>().unwrap(), Some(false));
    }
}
