//! `challenges` block parsing.

use anyhow::Result;
use std::collections::BTreeMap;
use tracing::trace;

use certfleet_challenge::{ChallengeMaterial, ManagedChallengeConfig, CHALLENGE_TYPE_DNS};

use super::helpers::{children_named, get_first_arg_string, get_string_args, get_string_entry};

pub fn parse_challenges(node: &kdl::KdlNode) -> Result<Vec<ManagedChallengeConfig>> {
    let mut challenges = Vec::new();

    for child in children_named(node, "challenge") {
        let id = get_first_arg_string(child).ok_or_else(|| {
            anyhow::anyhow!("Challenge requires an ID argument, e.g., challenge \"example\" {{ ... }}")
        })?;

        let provider = get_string_entry(child, "provider").ok_or_else(|| {
            anyhow::anyhow!(
                "Challenge '{}' requires a 'provider' field, e.g., provider \"dns.memory\"",
                id
            )
        })?;

        let mut parameters = BTreeMap::new();
        for param in children_named(child, "parameter") {
            match get_string_args(param).as_slice() {
                [key, value] => {
                    parameters.insert(key.clone(), value.clone());
                }
                _ => {
                    return Err(anyhow::anyhow!(
                        "Challenge '{}' parameter must have a name and a value, e.g., parameter \"zone\" \"Z123\"",
                        id
                    ));
                }
            }
        }

        let material = ChallengeMaterial {
            challenge_type: get_string_entry(child, "challenge-type")
                .unwrap_or_else(|| CHALLENGE_TYPE_DNS.to_string()),
            provider,
            credential_id: get_string_entry(child, "credential"),
            parameters,
        };

        let mut config = ManagedChallengeConfig::new(
            id.clone(),
            get_string_entry(child, "domain-match").unwrap_or_default(),
        )
        .with_challenge(material);
        config.title = get_string_entry(child, "title").unwrap_or_else(|| id.clone());
        config.description = get_string_entry(child, "description").unwrap_or_default();

        trace!(
            challenge_id = %id,
            domain_match = %config.domain_match,
            provider = %config.challenge.provider,
            "Parsed managed challenge"
        );
        challenges.push(config);
    }

    Ok(challenges)
}
