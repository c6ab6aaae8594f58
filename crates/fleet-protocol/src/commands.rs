//! Strongly-typed commands.
//!
//! On the wire a command is a [`CommandType`] tag plus a flat argument list.
//! [`HubCommand`] is the typed view of that pair: the hub builds one and
//! encodes it, the instance decodes it once and never touches raw arguments
//! again.

use certfleet_challenge::{ChallengeRequest, ManagedChallengeConfig};

use crate::models::{CertificateAuthority, ContactRegistration, ManagedItem, StoredCredential};
use crate::protocol::{CommandArgs, CommandType};
use crate::FleetProtocolError;

/// Argument keys used in command payloads.
pub mod keys {
    pub const INSTANCE_ID: &str = "instanceId";
    pub const MANAGED_CERT_ID: &str = "managedCertId";
    pub const MANAGED_CERT: &str = "managedCert";
    pub const MANAGED_CERTIFICATE_ID: &str = "managedCertificateId";
    pub const LIMIT: &str = "limit";
    pub const CERTIFICATE_AUTHORITY: &str = "certificateAuthority";
    pub const ID: &str = "id";
    pub const REGISTRATION: &str = "registration";
    pub const STORAGE_KEY: &str = "storageKey";
    pub const DEACTIVATE: &str = "deactivate";
    pub const ITEM: &str = "item";
    pub const PROVIDER_TYPE_ID: &str = "providerTypeId";
    pub const CREDENTIAL_ID: &str = "credentialId";
    pub const TASK_ID: &str = "taskId";
    pub const MANAGED_CHALLENGE: &str = "managedChallenge";
    pub const REQUEST: &str = "request";
}

/// A command with its decoded arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum HubCommand {
    GetManagedItem { managed_item_id: String },
    GetManagedItems,
    GetStatusSummary,
    GetManagedItemLog { managed_item_id: String, limit: u32 },
    GetManagedItemRenewalPreview { item: ManagedItem },
    UpdateManagedItem { item: ManagedItem },
    RemoveManagedItem { managed_item_id: String },
    TestManagedItemConfiguration { item: ManagedItem },
    PerformManagedItemRequest { managed_item_id: String },
    GetCertificateAuthorities,
    UpdateCertificateAuthority { authority: CertificateAuthority },
    RemoveCertificateAuthority { id: String },
    GetAcmeAccounts,
    AddAcmeAccount { registration: ContactRegistration },
    RemoveAcmeAccount { storage_key: String, deactivate: bool },
    GetStoredCredentials,
    UpdateStoredCredential { credential: StoredCredential },
    RemoveStoredCredential { storage_key: String },
    GetChallengeProviders,
    GetDnsZones { provider_type_id: String, credential_id: String },
    GetDeploymentProviders,
    ExecuteDeploymentTask { managed_item_id: String, task_id: String },
    GetManagedChallenges,
    UpdateManagedChallenge { config: ManagedChallengeConfig },
    RemoveManagedChallenge { id: String },
    PerformManagedChallenge { request: ChallengeRequest },
    CleanupManagedChallenge { request: ChallengeRequest },
    Reconnect,
}

impl HubCommand {
    pub fn command_type(&self) -> CommandType {
        match self {
            HubCommand::GetManagedItem { .. } => CommandType::GetManagedItem,
            HubCommand::GetManagedItems => CommandType::GetManagedItems,
            HubCommand::GetStatusSummary => CommandType::GetStatusSummary,
            HubCommand::GetManagedItemLog { .. } => CommandType::GetManagedItemLog,
            HubCommand::GetManagedItemRenewalPreview { .. } => {
                CommandType::GetManagedItemRenewalPreview
            }
            HubCommand::UpdateManagedItem { .. } => CommandType::UpdateManagedItem,
            HubCommand::RemoveManagedItem { .. } => CommandType::RemoveManagedItem,
            HubCommand::TestManagedItemConfiguration { .. } => {
                CommandType::TestManagedItemConfiguration
            }
            HubCommand::PerformManagedItemRequest { .. } => CommandType::PerformManagedItemRequest,
            HubCommand::GetCertificateAuthorities => CommandType::GetCertificateAuthorities,
            HubCommand::UpdateCertificateAuthority { .. } => CommandType::UpdateCertificateAuthority,
            HubCommand::RemoveCertificateAuthority { .. } => CommandType::RemoveCertificateAuthority,
            HubCommand::GetAcmeAccounts => CommandType::GetAcmeAccounts,
            HubCommand::AddAcmeAccount { .. } => CommandType::AddAcmeAccount,
            HubCommand::RemoveAcmeAccount { .. } => CommandType::RemoveAcmeAccount,
            HubCommand::GetStoredCredentials => CommandType::GetStoredCredentials,
            HubCommand::UpdateStoredCredential { .. } => CommandType::UpdateStoredCredential,
            HubCommand::RemoveStoredCredential { .. } => CommandType::RemoveStoredCredential,
            HubCommand::GetChallengeProviders => CommandType::GetChallengeProviders,
            HubCommand::GetDnsZones { .. } => CommandType::GetDnsZones,
            HubCommand::GetDeploymentProviders => CommandType::GetDeploymentProviders,
            HubCommand::ExecuteDeploymentTask { .. } => CommandType::ExecuteDeploymentTask,
            HubCommand::GetManagedChallenges => CommandType::GetManagedChallenges,
            HubCommand::UpdateManagedChallenge { .. } => CommandType::UpdateManagedChallenge,
            HubCommand::RemoveManagedChallenge { .. } => CommandType::RemoveManagedChallenge,
            HubCommand::PerformManagedChallenge { .. } => CommandType::PerformManagedChallenge,
            HubCommand::CleanupManagedChallenge { .. } => CommandType::CleanupManagedChallenge,
            HubCommand::Reconnect => CommandType::Reconnect,
        }
    }

    /// Whether the command changes state on the instance.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            HubCommand::UpdateManagedItem { .. }
                | HubCommand::RemoveManagedItem { .. }
                | HubCommand::PerformManagedItemRequest { .. }
                | HubCommand::UpdateCertificateAuthority { .. }
                | HubCommand::RemoveCertificateAuthority { .. }
                | HubCommand::AddAcmeAccount { .. }
                | HubCommand::RemoveAcmeAccount { .. }
                | HubCommand::UpdateStoredCredential { .. }
                | HubCommand::RemoveStoredCredential { .. }
                | HubCommand::ExecuteDeploymentTask { .. }
                | HubCommand::UpdateManagedChallenge { .. }
                | HubCommand::RemoveManagedChallenge { .. }
                | HubCommand::PerformManagedChallenge { .. }
                | HubCommand::CleanupManagedChallenge { .. }
        )
    }

    /// Encode the arguments into the flat wire form.
    pub fn to_args(&self) -> Result<CommandArgs, FleetProtocolError> {
        let args = CommandArgs::new();
        let args = match self {
            HubCommand::GetManagedItems
            | HubCommand::GetStatusSummary
            | HubCommand::GetCertificateAuthorities
            | HubCommand::GetAcmeAccounts
            | HubCommand::GetStoredCredentials
            | HubCommand::GetChallengeProviders
            | HubCommand::GetDeploymentProviders
            | HubCommand::GetManagedChallenges
            | HubCommand::Reconnect => args,

            HubCommand::GetManagedItem { managed_item_id }
            | HubCommand::RemoveManagedItem { managed_item_id }
            | HubCommand::PerformManagedItemRequest { managed_item_id } => {
                args.with(keys::MANAGED_CERT_ID, managed_item_id)
            }
            HubCommand::GetManagedItemLog {
                managed_item_id,
                limit,
            } => args
                .with(keys::MANAGED_CERT_ID, managed_item_id)
                .with(keys::LIMIT, limit.to_string()),
            HubCommand::GetManagedItemRenewalPreview { item }
            | HubCommand::UpdateManagedItem { item }
            | HubCommand::TestManagedItemConfiguration { item } => {
                args.with_json(keys::MANAGED_CERT, item)?
            }
            HubCommand::UpdateCertificateAuthority { authority } => {
                args.with_json(keys::CERTIFICATE_AUTHORITY, authority)?
            }
            HubCommand::RemoveCertificateAuthority { id }
            | HubCommand::RemoveManagedChallenge { id } => args.with(keys::ID, id),
            HubCommand::AddAcmeAccount { registration } => {
                args.with_json(keys::REGISTRATION, registration)?
            }
            HubCommand::RemoveAcmeAccount {
                storage_key,
                deactivate,
            } => args
                .with(keys::STORAGE_KEY, storage_key)
                .with(keys::DEACTIVATE, deactivate.to_string()),
            HubCommand::UpdateStoredCredential { credential } => {
                args.with_json(keys::ITEM, credential)?
            }
            HubCommand::RemoveStoredCredential { storage_key } => {
                args.with(keys::STORAGE_KEY, storage_key)
            }
            HubCommand::GetDnsZones {
                provider_type_id,
                credential_id,
            } => args
                .with(keys::PROVIDER_TYPE_ID, provider_type_id)
                .with(keys::CREDENTIAL_ID, credential_id),
            HubCommand::ExecuteDeploymentTask {
                managed_item_id,
                task_id,
            } => args
                .with(keys::MANAGED_CERTIFICATE_ID, managed_item_id)
                .with(keys::TASK_ID, task_id),
            HubCommand::UpdateManagedChallenge { config } => {
                args.with_json(keys::MANAGED_CHALLENGE, config)?
            }
            HubCommand::PerformManagedChallenge { request }
            | HubCommand::CleanupManagedChallenge { request } => {
                args.with_json(keys::REQUEST, request)?
            }
        };
        Ok(args)
    }

    /// Decode a wire command. `Ok(None)` for command types this build does
    /// not know.
    pub fn decode(
        command_type: &CommandType,
        args: &CommandArgs,
    ) -> Result<Option<Self>, FleetProtocolError> {
        let id = |key: &str| args.required(key).map(str::to_string);

        let command = match command_type {
            CommandType::GetManagedItem => HubCommand::GetManagedItem {
                managed_item_id: id(keys::MANAGED_CERT_ID)?,
            },
            CommandType::GetManagedItems => HubCommand::GetManagedItems,
            CommandType::GetStatusSummary => HubCommand::GetStatusSummary,
            CommandType::GetManagedItemLog => HubCommand::GetManagedItemLog {
                managed_item_id: id(keys::MANAGED_CERT_ID)?,
                limit: args.parse(keys::LIMIT)?,
            },
            CommandType::GetManagedItemRenewalPreview => HubCommand::GetManagedItemRenewalPreview {
                item: args.parse_json(keys::MANAGED_CERT)?,
            },
            CommandType::UpdateManagedItem => HubCommand::UpdateManagedItem {
                item: args.parse_json(keys::MANAGED_CERT)?,
            },
            CommandType::RemoveManagedItem => HubCommand::RemoveManagedItem {
                managed_item_id: id(keys::MANAGED_CERT_ID)?,
            },
            CommandType::TestManagedItemConfiguration => HubCommand::TestManagedItemConfiguration {
                item: args.parse_json(keys::MANAGED_CERT)?,
            },
            CommandType::PerformManagedItemRequest => HubCommand::PerformManagedItemRequest {
                managed_item_id: id(keys::MANAGED_CERT_ID)?,
            },
            CommandType::GetCertificateAuthorities => HubCommand::GetCertificateAuthorities,
            CommandType::UpdateCertificateAuthority => HubCommand::UpdateCertificateAuthority {
                authority: args.parse_json(keys::CERTIFICATE_AUTHORITY)?,
            },
            CommandType::RemoveCertificateAuthority => HubCommand::RemoveCertificateAuthority {
                id: id(keys::ID)?,
            },
            CommandType::GetAcmeAccounts => HubCommand::GetAcmeAccounts,
            CommandType::AddAcmeAccount => HubCommand::AddAcmeAccount {
                registration: args.parse_json(keys::REGISTRATION)?,
            },
            CommandType::RemoveAcmeAccount => HubCommand::RemoveAcmeAccount {
                storage_key: id(keys::STORAGE_KEY)?,
                deactivate: parse_flag(args, keys::DEACTIVATE)?,
            },
            CommandType::GetStoredCredentials => HubCommand::GetStoredCredentials,
            CommandType::UpdateStoredCredential => HubCommand::UpdateStoredCredential {
                credential: args.parse_json(keys::ITEM)?,
            },
            CommandType::RemoveStoredCredential => HubCommand::RemoveStoredCredential {
                storage_key: id(keys::STORAGE_KEY)?,
            },
            CommandType::GetChallengeProviders => HubCommand::GetChallengeProviders,
            CommandType::GetDnsZones => HubCommand::GetDnsZones {
                provider_type_id: id(keys::PROVIDER_TYPE_ID)?,
                credential_id: id(keys::CREDENTIAL_ID)?,
            },
            CommandType::GetDeploymentProviders => HubCommand::GetDeploymentProviders,
            CommandType::ExecuteDeploymentTask => HubCommand::ExecuteDeploymentTask {
                managed_item_id: id(keys::MANAGED_CERTIFICATE_ID)?,
                task_id: id(keys::TASK_ID)?,
            },
            CommandType::GetManagedChallenges => HubCommand::GetManagedChallenges,
            CommandType::UpdateManagedChallenge => HubCommand::UpdateManagedChallenge {
                config: args.parse_json(keys::MANAGED_CHALLENGE)?,
            },
            CommandType::RemoveManagedChallenge => HubCommand::RemoveManagedChallenge {
                id: id(keys::ID)?,
            },
            CommandType::PerformManagedChallenge => HubCommand::PerformManagedChallenge {
                request: args.parse_json(keys::REQUEST)?,
            },
            CommandType::CleanupManagedChallenge => HubCommand::CleanupManagedChallenge {
                request: args.parse_json(keys::REQUEST)?,
            },
            CommandType::Reconnect => HubCommand::Reconnect,
            CommandType::Other(_) => return Ok(None),
        };
        Ok(Some(command))
    }
}

/// Boolean flags are accepted in any case (`true`, `True`, `FALSE`).
fn parse_flag(args: &CommandArgs, key: &str) -> Result<bool, FleetProtocolError> {
    let raw = args.required(key)?.trim();
    if raw.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(FleetProtocolError::InvalidArgument {
            name: key.to_string(),
            reason: format!("expected true or false, got '{}'", raw),
        })
    }
}
