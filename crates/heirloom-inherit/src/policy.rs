//! Unlock policy
//!
//! Every timing rule for one vault in a single typed struct, validated once
//! when it is written and stored as plain columns.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_CHECK_IN_INTERVAL_DAYS: i64 = 7;
pub const MAX_CHECK_IN_INTERVAL_DAYS: i64 = 365;
/// Upper bound for the grace period and the quorum window
pub const MAX_PERIOD_DAYS: i64 = 3650;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Check-in interval must be 7..=365 days, got {0}")]
    InvalidInterval(i64),

    #[error("Grace period must be 1..=3650 days, got {0}")]
    InvalidGracePeriod(i64),

    #[error("Escalation threshold must be at least 1 missed check-in, got {0}")]
    InvalidEscalationThreshold(i64),

    #[error("Quorum window must be 1..=3650 days, got {0}")]
    InvalidQuorumWindow(i64),

    #[error("{0}")]
    Invalid(String),
}

/// Timing policy for a single vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnlockPolicy {
    /// Days between expected check-ins
    #[serde(default = "default_check_in_interval_days")]
    pub check_in_interval_days: i64,

    /// Days between quorum and unlock, during which a check-in still aborts
    #[serde(default = "default_grace_period_days")]
    pub grace_period_days: i64,

    /// Missed check-ins before contacts are asked to verify
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: i64,

    /// Two votes count as a quorum only if cast within this many days of each other
    #[serde(default = "default_quorum_window_days")]
    pub quorum_window_days: i64,
}

fn default_check_in_interval_days() -> i64 {
    90
}

fn default_grace_period_days() -> i64 {
    14
}

fn default_escalation_threshold() -> i64 {
    3
}

fn default_quorum_window_days() -> i64 {
    14
}

impl Default for UnlockPolicy {
    fn default() -> Self {
        Self {
            check_in_interval_days: default_check_in_interval_days(),
            grace_period_days: default_grace_period_days(),
            escalation_threshold: default_escalation_threshold(),
            quorum_window_days: default_quorum_window_days(),
        }
    }
}

impl UnlockPolicy {
    /// Build and validate a policy.
    pub fn new(
        check_in_interval_days: i64,
        grace_period_days: i64,
        escalation_threshold: i64,
        quorum_window_days: i64,
    ) -> Result<Self, PolicyError> {
        let policy = Self {
            check_in_interval_days,
            grace_period_days,
            escalation_threshold,
            quorum_window_days,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if !(MIN_CHECK_IN_INTERVAL_DAYS..=MAX_CHECK_IN_INTERVAL_DAYS)
            .contains(&self.check_in_interval_days)
        {
            return Err(PolicyError::InvalidInterval(self.check_in_interval_days));
        }
        if !(1..=MAX_PERIOD_DAYS).contains(&self.grace_period_days) {
            return Err(PolicyError::InvalidGracePeriod(self.grace_period_days));
        }
        if self.escalation_threshold < 1 {
            return Err(PolicyError::InvalidEscalationThreshold(
                self.escalation_threshold,
            ));
        }
        if !(1..=MAX_PERIOD_DAYS).contains(&self.quorum_window_days) {
            return Err(PolicyError::InvalidQuorumWindow(self.quorum_window_days));
        }
        Ok(())
    }

    /// Same policy with a different interval, validated.
    pub fn with_interval(self, check_in_interval_days: i64) -> Result<Self, PolicyError> {
        Self::new(
            check_in_interval_days,
            self.grace_period_days,
            self.escalation_threshold,
            self.quorum_window_days,
        )
    }

    pub fn check_in_interval(&self) -> Duration {
        Duration::days(self.check_in_interval_days)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::days(self.grace_period_days)
    }

    pub fn quorum_window(&self) -> Duration {
        Duration::days(self.quorum_window_days)
    }

    /// Missed count at which `Alive` escalates
    pub fn escalation_threshold(&self) -> u32 {
        u32::try_from(self.escalation_threshold).unwrap_or(u32::MAX)
    }
}
