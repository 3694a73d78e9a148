//! Vault unlock state machine
//!
//! The transition table only. Applying a transition atomically against the
//! stored `(state, version)` row is the coordinator's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultState {
    Alive,
    Escalation,
    PendingUnlock,
    /// Terminal
    Unlocked,
}

impl VaultState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VaultState::Alive => "alive",
            VaultState::Escalation => "escalation",
            VaultState::PendingUnlock => "pending_unlock",
            VaultState::Unlocked => "unlocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VaultState::Unlocked)
    }

    /// Whether contacts may vote in this state
    pub fn accepts_votes(&self) -> bool {
        matches!(self, VaultState::Escalation)
    }
}

impl fmt::Display for VaultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VaultState {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alive" => Ok(VaultState::Alive),
            "escalation" => Ok(VaultState::Escalation),
            "pending_unlock" => Ok(VaultState::PendingUnlock),
            "unlocked" => Ok(VaultState::Unlocked),
            other => Err(TransitionError::UnknownState(other.to_string())),
        }
    }
}

/// What drives a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Missed count reached the escalation threshold
    MissedThreshold,
    /// Two contacts confirmed death within the quorum window
    DeathVerified,
    /// The owner checked in
    CheckIn,
    /// `unlock_at` has passed
    GraceElapsed,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Trigger::MissedThreshold => "missed_threshold",
            Trigger::DeathVerified => "death_verified",
            Trigger::CheckIn => "check_in",
            Trigger::GraceElapsed => "grace_elapsed",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Vault is unlocked; no further transitions")]
    Terminal,

    #[error("Transition {trigger} not allowed from {from}")]
    NotAllowed { from: VaultState, trigger: Trigger },

    #[error("Grace period ended at {0}; the vault is due to unlock")]
    UnlockDue(DateTime<Utc>),

    #[error("Unknown vault state: {0}")]
    UnknownState(String),
}

/// The transition table, evaluated at `at`.
///
/// A check-in is valid in every non-terminal state, including `Alive`, where it
/// leaves the state unchanged. In `PendingUnlock` the deadline splits the two
/// exits: a check-in only before `unlock_at`, the unlock only at or after it.
pub fn next_state(
    current: &VaultUnlockState,
    trigger: Trigger,
    at: DateTime<Utc>,
) -> Result<VaultState, TransitionError> {
    use Trigger::*;
    use VaultState::*;

    match (current.state, trigger) {
        (Unlocked, _) => Err(TransitionError::Terminal),
        (PendingUnlock, CheckIn) if current.grace_elapsed(at) => Err(
            TransitionError::UnlockDue(current.unlock_at.unwrap_or(at)),
        ),
        (_, CheckIn) => Ok(Alive),
        (Alive, MissedThreshold) => Ok(Escalation),
        (Escalation, DeathVerified) => Ok(PendingUnlock),
        (PendingUnlock, GraceElapsed) if current.grace_elapsed(at) => Ok(Unlocked),
        (from, trigger) => Err(TransitionError::NotAllowed { from, trigger }),
    }
}

/// How a check-in was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInSource {
    /// Explicit check-in from the app
    Manual,
    /// Link in a reminder email
    Email,
    /// API client
    Api,
}

impl CheckInSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckInSource::Manual => "manual",
            CheckInSource::Email => "email",
            CheckInSource::Api => "api",
        }
    }
}

impl fmt::Display for CheckInSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckInSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(CheckInSource::Manual),
            "email" => Ok(CheckInSource::Email),
            "api" => Ok(CheckInSource::Api),
            other => Err(format!("unknown check-in source: {}", other)),
        }
    }
}

/// The authoritative per-owner state row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultUnlockState {
    pub state: VaultState,
    /// Incremented on every committed transition
    pub version: i64,
    /// Set only in `PendingUnlock`
    pub unlock_at: Option<DateTime<Utc>>,
    /// Open escalation cycle, if any
    pub cycle_id: Option<i64>,
}

impl VaultUnlockState {
    pub fn initial() -> Self {
        Self {
            state: VaultState::Alive,
            version: 0,
            unlock_at: None,
            cycle_id: None,
        }
    }

    /// Whether the grace period has run out.
    pub fn grace_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.state == VaultState::PendingUnlock && self.unlock_at.is_some_and(|at| now >= at)
    }
}
