//! Check-in scheduling
//!
//! [`CheckInScheduler::record_check_in`] resets the switch and, if the vault
//! had escalated, takes it back to `Alive` in the same transaction.
//!
//! [`CheckInScheduler::evaluate_due_check_ins`] is the periodic sweep. Any
//! number of workers may run it at once, each over its own [`Shard`] and
//! connection. Every owner is evaluated in its own transaction; the missed
//! count write is fenced on the values it was derived from and state changes
//! go through the versioned CAS, so a check-in committed in between always
//! wins.

use crate::audit::{self, AuditRecord};
use crate::contacts;
use crate::coordinator::{apply_transition, Transition};
use crate::db::{self, to_ts, whole_seconds};
use crate::error::{Result, VaultError};
use crate::outbox;
use crate::owners::{load_owner, load_state};
use crate::quorum::{close_cycle, open_cycle};
use chrono::{DateTime, Duration, Utc};
use heirloom_core::OwnerId;
use heirloom_inherit::heartbeat::{due_reminder, missed_action, missed_count, MissedAction, DEFAULT_LEAD_DAYS};
use heirloom_inherit::quorum::REQUIRED_VOTES;
use heirloom_inherit::state::next_state;
use heirloom_inherit::{CheckInSource, NotificationKind, Trigger, VaultEvent, VaultState};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// A slice of the owner table for one sweep worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub index: u32,
    pub count: u32,
}

impl Shard {
    /// Every owner
    pub const ALL: Shard = Shard { index: 0, count: 1 };

    /// Shard `index` of `count`; `None` if that is not a valid slice.
    pub fn new(index: u32, count: u32) -> Option<Self> {
        (count > 0 && index < count).then_some(Self { index, count })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInReceipt {
    pub owner_id: OwnerId,
    pub next_check_in_at: DateTime<Utc>,
    pub state: VaultState,
    pub version: i64,
    /// Escalation cycle this check-in cancelled
    pub cancelled_cycle: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Owners evaluated
    pub visited: usize,
    /// Upcoming-due reminders queued
    pub reminders: usize,
    pub events: Vec<VaultEvent>,
    /// Owners whose evaluation failed, with the error
    pub failed: Vec<(OwnerId, String)>,
}

impl SweepReport {
    pub fn merge(&mut self, other: SweepReport) {
        self.visited += other.visited;
        self.reminders += other.reminders;
        self.events.extend(other.events);
        self.failed.extend(other.failed);
    }

    pub fn escalations(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, VaultEvent::EscalationTriggered { .. }))
            .count()
    }
}

#[derive(Debug, Default)]
struct OwnerOutcome {
    reminders: usize,
    events: Vec<VaultEvent>,
}

#[derive(Debug, Clone)]
pub struct CheckInScheduler {
    lead_days: Vec<u32>,
}

impl Default for CheckInScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_LEAD_DAYS.to_vec())
    }
}

impl CheckInScheduler {
    /// `lead_days`: how many days before a due date to send upcoming-due
    /// reminders. Zero leads are ignored.
    pub fn new(mut lead_days: Vec<u32>) -> Self {
        lead_days.retain(|&d| d > 0);
        lead_days.sort_unstable_by(|a, b| b.cmp(a));
        lead_days.dedup();
        Self { lead_days }
    }

    pub fn lead_days(&self) -> &[u32] {
        &self.lead_days
    }

    /// Record a check-in.
    ///
    /// Repeating a check-in at the same or a later time leaves the same
    /// result: missed count zero, next due one interval after the latest
    /// check-in, no escalation pending.
    pub fn record_check_in(
        &self,
        conn: &mut Connection,
        owner: &OwnerId,
        source: CheckInSource,
        at: DateTime<Utc>,
    ) -> Result<CheckInReceipt> {
        db::with_transaction(conn, |tx| record_check_in_tx(tx, owner, source, at))
    }

    /// Sweep every owner.
    pub fn evaluate_due_check_ins(
        &self,
        conn: &mut Connection,
        now: DateTime<Utc>,
    ) -> Result<SweepReport> {
        self.evaluate_shard(conn, now, Shard::ALL)
    }

    /// Sweep the owners in `shard`.
    pub fn evaluate_shard(
        &self,
        conn: &mut Connection,
        now: DateTime<Utc>,
        shard: Shard,
    ) -> Result<SweepReport> {
        let now = whole_seconds(now);
        let horizon = now + Duration::days(i64::from(self.lead_days.first().copied().unwrap_or(0)));

        let candidates: Vec<OwnerId> = {
            let mut stmt = conn.prepare_cached(
                "SELECT o.owner_id FROM owners o
                 JOIN vault_unlock_state s ON s.owner_id = o.owner_id
                 WHERE s.state != 'unlocked' AND o.remediation_required = 0
                   AND o.next_check_in_at <= ?1
                   AND (o.rowid % ?2) = ?3
                 ORDER BY o.next_check_in_at",
            )?;
            let rows = stmt.query_map(
                params![to_ts(horizon), shard.count, shard.index],
                |row| Ok(OwnerId::new(row.get::<_, String>(0)?)),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut report = SweepReport::default();
        for owner in candidates {
            report.visited += 1;
            match db::with_transaction(conn, |tx| self.evaluate_owner(tx, &owner, now)) {
                Ok(outcome) => {
                    report.reminders += outcome.reminders;
                    report.events.extend(outcome.events);
                }
                Err(e) => {
                    log::warn!("Sweep of {} failed: {}", owner, e);
                    report.failed.push((owner, e.to_string()));
                }
            }
        }

        log::debug!(
            "Shard {}/{}: visited {}, {} events, {} reminders",
            shard.index,
            shard.count,
            report.visited,
            report.events.len(),
            report.reminders
        );
        Ok(report)
    }

    fn evaluate_owner(
        &self,
        conn: &Connection,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> Result<OwnerOutcome> {
        let record = load_owner(conn, owner)?;
        let state = load_state(conn, owner)?;
        let mut outcome = OwnerOutcome::default();
        if record.remediation_required || state.state.is_terminal() {
            return Ok(outcome);
        }

        if state.state == VaultState::Alive {
            if let Some(lead) = due_reminder(
                record.next_check_in_at,
                now,
                &self.lead_days,
                record.last_reminder_lead,
            ) {
                let changed = conn.execute(
                    "UPDATE owners SET last_reminder_lead = ?2
                     WHERE owner_id = ?1 AND next_check_in_at = ?3",
                    params![owner.as_str(), lead, to_ts(record.next_check_in_at)],
                )?;
                if changed == 1 {
                    outbox::enqueue_owner(
                        conn,
                        owner,
                        NotificationKind::UpcomingCheckIn,
                        &json!({ "due_at": record.next_check_in_at, "days_left": lead }),
                        now,
                    )?;
                    outcome.reminders += 1;
                }
            }
        }

        let current = missed_count(
            record.check_in_anchor(),
            now,
            record.policy.check_in_interval(),
        );
        let action = missed_action(
            state.state,
            record.missed_count,
            current,
            record.policy.escalation_threshold(),
        );
        if action == MissedAction::None {
            return Ok(outcome);
        }

        // Fence: a check-in since the read resets both columns
        let changed = conn.execute(
            "UPDATE owners SET missed_count = ?2
             WHERE owner_id = ?1 AND missed_count = ?3 AND next_check_in_at = ?4",
            params![
                owner.as_str(),
                current,
                record.missed_count,
                to_ts(record.next_check_in_at)
            ],
        )?;
        if changed == 0 {
            return Err(VaultError::ConcurrentTransitionConflict {
                owner: owner.clone(),
                expected_version: state.version,
            });
        }
        audit::record(
            conn,
            owner,
            AuditRecord {
                action: "check_in_missed",
                detail: Some(format!("missed {}", current)),
                ..Default::default()
            },
            now,
        )?;
        outcome.events.push(VaultEvent::CheckInMissed {
            owner_id: owner.clone(),
            missed_count: current,
        });

        let reminder = json!({ "missed_count": current, "due_at": record.next_check_in_at });
        match action {
            MissedAction::Reminder => {
                outbox::enqueue_owner(conn, owner, NotificationKind::CheckInReminder, &reminder, now)?;
            }
            MissedAction::UrgentReminder => {
                outbox::enqueue_owner(conn, owner, NotificationKind::UrgentReminder, &reminder, now)?;
            }
            MissedAction::Escalate => {
                let confirmed = contacts::confirmed_count(conn, owner)?;
                if confirmed < REQUIRED_VOTES {
                    log::warn!(
                        "Escalating {} with only {} confirmed contact(s); quorum cannot be reached yet",
                        owner,
                        confirmed
                    );
                }

                let cycle_id = open_cycle(conn, owner, now)?;
                apply_transition(conn, owner, &state, &Transition::Escalate { cycle_id }, now)?;

                outbox::enqueue_owner(
                    conn,
                    owner,
                    NotificationKind::FinalWarning,
                    &json!({ "missed_count": current, "cycle_id": cycle_id }),
                    now,
                )?;
                outbox::enqueue_confirmed_contacts(
                    conn,
                    owner,
                    NotificationKind::VerificationRequest,
                    &json!({ "owner_id": owner, "cycle_id": cycle_id }),
                    now,
                )?;
                outcome.events.push(VaultEvent::EscalationTriggered {
                    owner_id: owner.clone(),
                    cycle_id,
                });
            }
            MissedAction::Record | MissedAction::None => {}
        }

        log::info!("Owner {} missed {} check-in(s)", owner, current);
        Ok(outcome)
    }
}

/// Body of [`CheckInScheduler::record_check_in`], run inside the caller's
/// transaction.
pub fn record_check_in_tx(
    conn: &Connection,
    owner: &OwnerId,
    source: CheckInSource,
    at: DateTime<Utc>,
) -> Result<CheckInReceipt> {
    let at = whole_seconds(at);
    let state = load_state(conn, owner)?;
    // Terminal, or past unlock_at: the check-in is refused before anything is written
    if let Err(e) = next_state(&state, Trigger::CheckIn, at) {
        log::warn!("Check-in for {} at {} refused: {}", owner, at, e);
        return Err(e.into());
    }
    let record = load_owner(conn, owner)?;

    conn.execute(
        "INSERT INTO check_in_records (owner_id, at, source) VALUES (?1, ?2, ?3)",
        params![owner.as_str(), to_ts(at), source.as_str()],
    )?;

    let anchor = record.last_check_in_at.map_or(at, |last| last.max(at));
    let next_check_in_at = anchor + record.policy.check_in_interval();
    conn.execute(
        "UPDATE owners SET last_check_in_at = ?2, next_check_in_at = ?3,
            missed_count = 0, last_reminder_lead = NULL
         WHERE owner_id = ?1",
        params![owner.as_str(), to_ts(anchor), to_ts(next_check_in_at)],
    )?;

    let (state, cancelled_cycle) = if state.state == VaultState::Alive {
        (state, None)
    } else {
        let next = apply_transition(conn, owner, &state, &Transition::CheckIn, at)?;
        if let Some(cycle_id) = state.cycle_id {
            close_cycle(conn, owner, cycle_id, "cancelled", at)?;
            outbox::enqueue_confirmed_contacts(
                conn,
                owner,
                NotificationKind::EscalationCancelled,
                &json!({ "owner_id": owner, "cycle_id": cycle_id }),
                at,
            )?;
        }
        log::warn!(
            "Owner {} checked in during {}; escalation cancelled",
            owner,
            state.state
        );
        (next, state.cycle_id)
    };

    log::info!(
        "Check-in for {} via {}; next due {}",
        owner,
        source.as_str(),
        next_check_in_at
    );
    Ok(CheckInReceipt {
        owner_id: owner.clone(),
        next_check_in_at,
        state: state.state,
        version: state.version,
        cancelled_cycle,
    })
}
