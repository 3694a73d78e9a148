//! Error taxonomy for vault operations

use heirloom_core::{ContactId, OwnerId};
use heirloom_inherit::{PolicyError, TransitionError};
use heirloom_shamir::ShamirError;
use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a legacy token redemption was refused.
///
/// Kept for logs and callers that are trusted with it. The `Display` of
/// [`VaultError::AccessDenied`] never shows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotFound,
    Expired,
    Exhausted,
    NotUnlocked,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DenyReason::NotFound => "not_found",
            DenyReason::Expired => "expired",
            DenyReason::Exhausted => "exhausted",
            DenyReason::NotUnlocked => "not_unlocked",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Owner not found: {0}")]
    OwnerNotFound(OwnerId),

    #[error("Owner already provisioned: {0}")]
    OwnerExists(OwnerId),

    #[error("Trusted contact not found: {0}")]
    ContactNotFound(ContactId),

    #[error("Trusted contact {0} has not confirmed enrollment")]
    ContactNotConfirmed(ContactId),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Escalation cycle {submitted} is not the current cycle for {owner}")]
    QuorumCycleMismatch { owner: OwnerId, submitted: i64 },

    #[error("Contact {contact} already voted in cycle {cycle_id}")]
    DuplicateVote { contact: ContactId, cycle_id: i64 },

    #[error("Concurrent transition conflict for {owner} at version {expected_version}")]
    ConcurrentTransitionConflict {
        owner: OwnerId,
        expected_version: i64,
    },

    #[error("Invalid transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("Invalid share for {owner}: {reason}; manual remediation required")]
    InvalidShare { owner: OwnerId, reason: String },

    #[error("Vault {0} is flagged for manual remediation")]
    RemediationRequired(OwnerId),

    #[error("cannot grant access")]
    AccessDenied(DenyReason),

    #[error("Share custody error: {0}")]
    Shares(ShamirError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// Map a share-custody failure for `owner`. Integrity failures become
    /// [`VaultError::InvalidShare`].
    pub fn from_shares(owner: &OwnerId, err: ShamirError) -> Self {
        match err {
            ShamirError::InvalidShare(reason) => VaultError::InvalidShare {
                owner: owner.clone(),
                reason,
            },
            other => VaultError::Shares(other),
        }
    }

    /// Worth retrying automatically with a fresh read.
    pub fn is_retryable(&self) -> bool {
        match self {
            VaultError::ConcurrentTransitionConflict { .. } => true,
            VaultError::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            }
            _ => false,
        }
    }

    /// Integrity failures. Never retried; an operator has to look.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VaultError::InvalidShare { .. } | VaultError::RemediationRequired(_)
        )
    }

    /// Redemption refusal reason, if this is one.
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            VaultError::AccessDenied(reason) => Some(*reason),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
