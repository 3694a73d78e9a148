//! Dead man's switch arithmetic.
//!
//! Pure logic: no I/O, no clock. Callers pass `now` in and act on the result.
//!
//! # Missed check-ins
//!
//! Due dates fall every `interval` after the last check-in (or after
//! provisioning, if the owner never checked in). A due date counts as missed
//! once `now` is strictly past it:
//!
//! ```text
//! anchor        due 1          due 2          due 3
//!   |-------------|--------------|--------------|------>
//!       missed=0      missed=1       missed=2     missed=3
//! ```
//!
//! The count is always recomputed from the anchor, so running the sweep twice
//! or from two workers gives the same answer.

use crate::state::VaultState;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Reminder lead days used when none are configured
pub const DEFAULT_LEAD_DAYS: [u32; 3] = [7, 3, 1];

const SECS_PER_DAY: i64 = 86_400;

/// Number of due dates strictly before `now`.
pub fn missed_count(anchor: DateTime<Utc>, now: DateTime<Utc>, interval: Duration) -> u32 {
    let elapsed = (now - anchor).num_seconds();
    let interval = interval.num_seconds();
    if elapsed <= 0 || interval <= 0 {
        return 0;
    }
    u32::try_from((elapsed - 1) / interval).unwrap_or(u32::MAX)
}

/// The next due date after the check-in anchor.
pub fn next_due(anchor: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    anchor + interval
}

/// Whole days until `due`, rounded up. Negative once overdue.
pub fn days_until_due(due: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let secs = (due - now).num_seconds();
    if secs > 0 {
        (secs + SECS_PER_DAY - 1) / SECS_PER_DAY
    } else {
        -((-secs) / SECS_PER_DAY)
    }
}

/// What a sweep should do after recomputing an owner's missed count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissedAction {
    /// Nothing new since the last sweep
    None,
    /// Record the new count and remind the owner
    Reminder,
    /// Record the new count and send an urgent reminder
    UrgentReminder,
    /// Record the new count and open an escalation cycle
    Escalate,
    /// Record the new count only; already escalated
    Record,
}

/// Decide what a change in missed count means.
///
/// `previous` is the stored count, `current` the recomputed one.
pub fn missed_action(
    state: VaultState,
    previous: u32,
    current: u32,
    escalation_threshold: u32,
) -> MissedAction {
    if state.is_terminal() || current <= previous {
        return MissedAction::None;
    }
    if state != VaultState::Alive {
        return MissedAction::Record;
    }
    if current >= escalation_threshold {
        return MissedAction::Escalate;
    }
    if current == 1 {
        MissedAction::Reminder
    } else {
        MissedAction::UrgentReminder
    }
}

/// Pick the upcoming-due reminder to send now, if any.
///
/// Returns the lead (in days) of the reminder to send. Each lead fires at most
/// once per due date: `last_sent` is the lead already sent for this due date,
/// and only a strictly smaller lead can follow it. Once the due date has passed
/// the missed-check-in path takes over and nothing is returned.
pub fn due_reminder(
    due: DateTime<Utc>,
    now: DateTime<Utc>,
    lead_days: &[u32],
    last_sent: Option<u32>,
) -> Option<u32> {
    if now >= due {
        return None;
    }

    let lead = lead_days
        .iter()
        .copied()
        .filter(|&lead| now >= due - Duration::days(i64::from(lead)))
        .min()?;

    match last_sent {
        Some(sent) if sent <= lead => None,
        _ => Some(lead),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_missed_count_boundaries() {
        let interval = Duration::days(90);
        assert_eq!(missed_count(t0(), t0(), interval), 0);
        assert_eq!(missed_count(t0(), t0() + Duration::days(90), interval), 0);
        assert_eq!(
            missed_count(t0(), t0() + Duration::days(90) + Duration::seconds(1), interval),
            1
        );
        assert_eq!(missed_count(t0(), t0() + Duration::days(91), interval), 1);
        assert_eq!(missed_count(t0(), t0() + Duration::days(181), interval), 2);
        assert_eq!(missed_count(t0(), t0() + Duration::days(270), interval), 2);
        assert_eq!(missed_count(t0(), t0() + Duration::days(271), interval), 3);
    }

    #[test]
    fn test_missed_count_clock_skew() {
        // A check-in timestamp in the future of `now` counts as no misses
        assert_eq!(
            missed_count(t0() + Duration::days(5), t0(), Duration::days(7)),
            0
        );
    }

    #[test]
    fn test_days_until_due() {
        let due = t0() + Duration::days(3);
        assert_eq!(days_until_due(due, t0()), 3);
        assert_eq!(days_until_due(due, t0() + Duration::hours(1)), 3);
        assert_eq!(days_until_due(due, due), 0);
        assert_eq!(days_until_due(due, due + Duration::days(2)), -2);
    }

    #[test]
    fn test_missed_action_ladder() {
        use MissedAction::*;
        let alive = VaultState::Alive;
        assert_eq!(missed_action(alive, 0, 0, 3), None);
        assert_eq!(missed_action(alive, 0, 1, 3), Reminder);
        assert_eq!(missed_action(alive, 1, 1, 3), None);
        assert_eq!(missed_action(alive, 1, 2, 3), UrgentReminder);
        assert_eq!(missed_action(alive, 2, 3, 3), Escalate);
        // Sweeps that were skipped still escalate in one go
        assert_eq!(missed_action(alive, 0, 4, 3), Escalate);
    }

    #[test]
    fn test_missed_action_threshold_one() {
        assert_eq!(
            missed_action(VaultState::Alive, 0, 1, 1),
            MissedAction::Escalate
        );
    }

    #[test]
    fn test_missed_action_after_escalation() {
        assert_eq!(
            missed_action(VaultState::Escalation, 3, 4, 3),
            MissedAction::Record
        );
        assert_eq!(
            missed_action(VaultState::PendingUnlock, 4, 5, 3),
            MissedAction::Record
        );
        assert_eq!(
            missed_action(VaultState::Unlocked, 4, 5, 3),
            MissedAction::None
        );
    }

    #[test]
    fn test_due_reminder_ladder() {
        let due = t0() + Duration::days(30);
        let leads = DEFAULT_LEAD_DAYS;

        assert_eq!(due_reminder(due, t0(), &leads, None), None);
        assert_eq!(
            due_reminder(due, due - Duration::days(7), &leads, None),
            Some(7)
        );
        assert_eq!(
            due_reminder(due, due - Duration::days(6), &leads, Some(7)),
            None
        );
        assert_eq!(
            due_reminder(due, due - Duration::days(3), &leads, Some(7)),
            Some(3)
        );
        assert_eq!(
            due_reminder(due, due - Duration::hours(12), &leads, Some(3)),
            Some(1)
        );
        assert_eq!(
            due_reminder(due, due - Duration::hours(1), &leads, Some(1)),
            None
        );
        assert_eq!(due_reminder(due, due, &leads, None), None);
    }

    #[test]
    fn test_due_reminder_skips_to_nearest_lead() {
        // Sweep was down for a week: only the closest reminder goes out
        let due = t0() + Duration::days(30);
        assert_eq!(
            due_reminder(due, due - Duration::hours(6), &DEFAULT_LEAD_DAYS, None),
            Some(1)
        );
    }

    #[test]
    fn test_due_reminder_no_leads() {
        let due = t0() + Duration::days(1);
        assert_eq!(due_reminder(due, t0(), &[], None), None);
    }
}
