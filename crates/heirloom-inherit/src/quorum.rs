//! Trusted-contact quorum
//!
//! Two distinct contacts asserting death, within `quorum_window` of each other,
//! verify the owner's death for the current escalation cycle. A cycle never
//! expires on its own: old votes simply stop pairing with new ones once they
//! fall out of the window.

use chrono::{DateTime, Duration, Utc};
use heirloom_core::ContactId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Distinct contacts needed for a quorum
pub const REQUIRED_VOTES: usize = 2;

/// Maximum enrolled contacts per owner
pub const MAX_CONTACTS: usize = 3;

/// What a contact asserts about the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assertion {
    Deceased,
    /// Recorded, but never counts toward a quorum
    Alive,
}

impl Assertion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Assertion::Deceased => "deceased",
            Assertion::Alive => "alive",
        }
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Assertion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deceased" => Ok(Assertion::Deceased),
            "alive" => Ok(Assertion::Alive),
            other => Err(format!("unknown assertion: {}", other)),
        }
    }
}

/// One recorded vote in a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub contact_id: ContactId,
    pub submitted_at: DateTime<Utc>,
    pub assertion: Assertion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumProgress {
    /// Distinct contacts that asserted death this cycle
    pub distinct_votes: usize,
    pub required: usize,
    /// When the quorum was reached, if it was
    pub reached_at: Option<DateTime<Utc>>,
}

impl QuorumProgress {
    pub fn empty() -> Self {
        Self {
            distinct_votes: 0,
            required: REQUIRED_VOTES,
            reached_at: None,
        }
    }

    pub fn is_reached(&self) -> bool {
        self.reached_at.is_some()
    }
}

/// Tally the votes of one cycle.
///
/// Only `Deceased` votes count, each contact once (its earliest vote). The
/// quorum is reached at the first vote that has another contact's vote within
/// `window` before it.
pub fn tally(votes: &[Vote], window: Duration) -> QuorumProgress {
    let mut earliest: HashMap<&ContactId, DateTime<Utc>> = HashMap::new();
    for vote in votes.iter().filter(|v| v.assertion == Assertion::Deceased) {
        earliest
            .entry(&vote.contact_id)
            .and_modify(|at| *at = (*at).min(vote.submitted_at))
            .or_insert(vote.submitted_at);
    }

    let mut times: Vec<DateTime<Utc>> = earliest.values().copied().collect();
    times.sort();

    let reached_at = times
        .windows(REQUIRED_VOTES)
        .find(|pair| pair[REQUIRED_VOTES - 1] - pair[0] <= window)
        .map(|pair| pair[REQUIRED_VOTES - 1]);

    QuorumProgress {
        distinct_votes: times.len(),
        required: REQUIRED_VOTES,
        reached_at,
    }
}
