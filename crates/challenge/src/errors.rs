//! Challenge resolution errors.

use certfleet_common::ActionResult;
use thiserror::Error;

/// Message returned when no managed challenge covers the requested identifier.
pub const NO_MATCH_MESSAGE: &str = "No matching challenge found";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("No matching challenge found")]
    NoMatchingChallenge,

    /// The record provider reported a hard failure
    #[error("{0}")]
    ProviderFailure(String),

    /// The record provider needs a human to act; never retried automatically
    #[error("{0}")]
    AwaitingUserAction(String),

    #[error("Record provider '{0}' is not available")]
    ProviderUnavailable(String),

    #[error("Managed challenge store error: {0}")]
    Store(String),
}

impl From<ChallengeError> for ActionResult {
    fn from(err: ChallengeError) -> Self {
        match err {
            ChallengeError::AwaitingUserAction(message) => ActionResult::awaiting_user(message),
            other => ActionResult::failure(other.to_string()),
        }
    }
}
