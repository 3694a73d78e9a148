//! Trusted-contact verification
//!
//! Contacts vote on an escalation cycle. Votes are append-only and unique per
//! `(contact, owner, cycle)`. When two distinct contacts assert the owner is
//! deceased within the quorum window, the vault moves to `PendingUnlock` and
//! the grace timer starts at the instant the quorum was reached.

use crate::audit::{self, AuditRecord};
use crate::coordinator::{apply_transition, Transition};
use crate::db::{self, from_ts, parse_text, to_ts, whole_seconds};
use crate::error::{Result, VaultError};
use crate::outbox;
use crate::owners::{load_owner, load_state};
use chrono::{DateTime, Utc};
use heirloom_core::{ContactId, OwnerId};
use heirloom_inherit::quorum::tally;
use heirloom_inherit::{Assertion, NotificationKind, QuorumProgress, VaultState, Vote};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub owner_id: OwnerId,
    pub cycle_id: i64,
    pub progress: QuorumProgress,
    /// State after this vote was applied
    pub state: VaultState,
    pub version: i64,
    pub unlock_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedContactQuorum;

impl TrustedContactQuorum {
    pub fn new() -> Self {
        Self
    }

    /// Record `contact`'s assertion about `owner` for escalation `cycle_id`.
    pub fn submit_verification(
        &self,
        conn: &mut Connection,
        contact: &ContactId,
        owner: &OwnerId,
        cycle_id: i64,
        assertion: Assertion,
        now: DateTime<Utc>,
    ) -> Result<VerificationOutcome> {
        db::with_transaction(conn, |tx| {
            submit_verification_tx(tx, contact, owner, cycle_id, assertion, now)
        })
    }
}

/// Body of [`TrustedContactQuorum::submit_verification`], run inside the
/// caller's transaction.
pub fn submit_verification_tx(
    conn: &Connection,
    contact: &ContactId,
    owner: &OwnerId,
    cycle_id: i64,
    assertion: Assertion,
    now: DateTime<Utc>,
) -> Result<VerificationOutcome> {
    let now = whole_seconds(now);

    let enrolled = db::optional(conn.query_row(
        "SELECT owner_id, confirmed_at IS NOT NULL FROM trusted_contacts WHERE contact_id = ?1",
        params![contact.as_str()],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
    ))?;
    match enrolled {
        Some((enrolled_for, _)) if enrolled_for != owner.as_str() => {
            return Err(VaultError::ContactNotFound(contact.clone()))
        }
        Some((_, false)) => return Err(VaultError::ContactNotConfirmed(contact.clone())),
        Some((_, true)) => {}
        None => return Err(VaultError::ContactNotFound(contact.clone())),
    }

    let state = load_state(conn, owner)?;
    if !state.state.accepts_votes() || state.cycle_id != Some(cycle_id) {
        log::warn!(
            "Vote from {} for {} cycle {} rejected; vault is {} (cycle {:?})",
            contact,
            owner,
            cycle_id,
            state.state,
            state.cycle_id
        );
        return Err(VaultError::QuorumCycleMismatch {
            owner: owner.clone(),
            submitted: cycle_id,
        });
    }

    let inserted = conn.execute(
        "INSERT INTO verification_attempts
            (contact_id, owner_id, cycle_id, submitted_at, assertion)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            contact.as_str(),
            owner.as_str(),
            cycle_id,
            to_ts(now),
            assertion.as_str()
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(e) if db::is_constraint_violation(&e) => {
            return Err(VaultError::DuplicateVote {
                contact: contact.clone(),
                cycle_id,
            })
        }
        Err(e) => return Err(e.into()),
    }

    audit::record(
        conn,
        owner,
        AuditRecord {
            action: "verification_submitted",
            detail: Some(format!("{} asserts {} (cycle {})", contact, assertion, cycle_id)),
            ..Default::default()
        },
        now,
    )?;
    if assertion == Assertion::Alive {
        log::warn!("Contact {} reports owner {} alive", contact, owner);
    }

    let policy = load_owner(conn, owner)?.policy;
    let progress = tally(&cycle_votes(conn, owner, cycle_id)?, policy.quorum_window());

    let state = match progress.reached_at {
        Some(reached_at) if state.state == VaultState::Escalation => {
            let unlock_at = reached_at + policy.grace_period();
            let next = apply_transition(
                conn,
                owner,
                &state,
                &Transition::VerifyDeath {
                    quorum_reached_at: reached_at,
                    unlock_at,
                },
                now,
            )?;
            outbox::enqueue_owner(
                conn,
                owner,
                NotificationKind::LastChance,
                &json!({ "unlock_at": unlock_at, "cycle_id": cycle_id }),
                now,
            )?;
            next
        }
        _ => state,
    };

    log::info!(
        "Cycle {} for {}: {}/{} votes",
        cycle_id,
        owner,
        progress.distinct_votes,
        progress.required
    );

    Ok(VerificationOutcome {
        owner_id: owner.clone(),
        cycle_id,
        progress,
        state: state.state,
        version: state.version,
        unlock_at: state.unlock_at,
    })
}

/// Every vote recorded for `owner` in `cycle_id`, in submission order.
pub fn cycle_votes(conn: &Connection, owner: &OwnerId, cycle_id: i64) -> Result<Vec<Vote>> {
    let mut stmt = conn.prepare_cached(
        "SELECT contact_id, submitted_at, assertion FROM verification_attempts
         WHERE owner_id = ?1 AND cycle_id = ?2
         ORDER BY submitted_at, id",
    )?;
    let rows = stmt.query_map(params![owner.as_str(), cycle_id], |row| {
        Ok(Vote {
            contact_id: ContactId::new(row.get::<_, String>(0)?),
            submitted_at: from_ts(row.get(1)?)?,
            assertion: parse_text(2, row.get(2)?)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Open the next escalation cycle for `owner` and return its id.
pub(crate) fn open_cycle(conn: &Connection, owner: &OwnerId, now: DateTime<Utc>) -> Result<i64> {
    let cycle_id: i64 = conn.query_row(
        "UPDATE owners SET cycle_counter = cycle_counter + 1 WHERE owner_id = ?1
         RETURNING cycle_counter",
        params![owner.as_str()],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO escalation_cycles (owner_id, cycle_id, opened_at) VALUES (?1, ?2, ?3)",
        params![owner.as_str(), cycle_id, to_ts(now)],
    )?;
    Ok(cycle_id)
}

pub(crate) fn close_cycle(
    conn: &Connection,
    owner: &OwnerId,
    cycle_id: i64,
    outcome: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE escalation_cycles SET closed_at = ?3, outcome = ?4
         WHERE owner_id = ?1 AND cycle_id = ?2 AND closed_at IS NULL",
        params![owner.as_str(), cycle_id, to_ts(now), outcome],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::{confirm_contact, enroll_contact};
    use crate::db::open_in_memory;
    use crate::keyring::MemoryKeyring;
    use crate::owners::{provision, ProvisionRequest};
    use chrono::{Duration, TimeZone};
    use heirloom_core::HolderKeyRef;
    use heirloom_inherit::UnlockPolicy;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    /// Owner "bob" in Escalation cycle 1 with contacts c1, c2 confirmed and c3
    /// enrolled only.
    fn escalated() -> (Connection, OwnerId) {
        let mut conn = open_in_memory().unwrap();
        let ring = MemoryKeyring::new();
        let holders = [
            HolderKeyRef::from("device"),
            HolderKeyRef::from("c1"),
            HolderKeyRef::from("escrow"),
        ];
        for h in &holders {
            ring.generate(h);
        }
        let owner = OwnerId::from("bob");
        provision(
            &mut conn,
            &ring,
            &ProvisionRequest {
                owner_id: owner.clone(),
                email: Some("bob@example.com".into()),
                policy: UnlockPolicy::default(),
                holders,
            },
            t0(),
        )
        .unwrap();

        for (id, confirm) in [("c1", true), ("c2", true), ("c3", false)] {
            let contact = ContactId::from(id);
            enroll_contact(&mut conn, &owner, &contact, id, None, t0()).unwrap();
            if confirm {
                confirm_contact(&mut conn, &contact, t0()).unwrap();
            }
        }

        let cycle = open_cycle(&conn, &owner, t0()).unwrap();
        let state = load_state(&conn, &owner).unwrap();
        apply_transition(&conn, &owner, &state, &Transition::Escalate { cycle_id: cycle }, t0())
            .unwrap();
        (conn, owner)
    }

    fn vote(
        conn: &mut Connection,
        owner: &OwnerId,
        contact: &str,
        cycle: i64,
        at: DateTime<Utc>,
    ) -> Result<VerificationOutcome> {
        TrustedContactQuorum::new().submit_verification(
            conn,
            &ContactId::from(contact),
            owner,
            cycle,
            Assertion::Deceased,
            at,
        )
    }

    #[test]
    fn test_two_votes_start_grace() {
        let (mut conn, owner) = escalated();

        let first = vote(&mut conn, &owner, "c1", 1, t0() + Duration::days(1)).unwrap();
        assert_eq!(first.state, VaultState::Escalation);
        assert_eq!(first.progress.distinct_votes, 1);

        let at = t0() + Duration::days(3);
        let second = vote(&mut conn, &owner, "c2", 1, at).unwrap();
        assert_eq!(second.state, VaultState::PendingUnlock);
        assert_eq!(second.unlock_at, Some(at + Duration::days(14)));
        assert_eq!(second.progress.reached_at, Some(at));

        let queued = outbox::for_owner(&conn, &owner).unwrap();
        assert!(queued.contains(&("bob@example.com".to_string(), NotificationKind::LastChance)));
    }

    #[test]
    fn test_votes_outside_window_do_not_count() {
        let (mut conn, owner) = escalated();
        vote(&mut conn, &owner, "c1", 1, t0()).unwrap();
        let late = vote(&mut conn, &owner, "c2", 1, t0() + Duration::days(15)).unwrap();
        assert_eq!(late.state, VaultState::Escalation);
        assert!(!late.progress.is_reached());
    }

    #[test]
    fn test_duplicate_vote_rejected() {
        let (mut conn, owner) = escalated();
        vote(&mut conn, &owner, "c1", 1, t0()).unwrap();
        assert!(matches!(
            vote(&mut conn, &owner, "c1", 1, t0() + Duration::hours(1)),
            Err(VaultError::DuplicateVote { cycle_id: 1, .. })
        ));
        assert_eq!(cycle_votes(&conn, &owner, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_unconfirmed_and_unknown_contacts_rejected() {
        let (mut conn, owner) = escalated();
        assert!(matches!(
            vote(&mut conn, &owner, "c3", 1, t0()),
            Err(VaultError::ContactNotConfirmed(_))
        ));
        assert!(matches!(
            vote(&mut conn, &owner, "stranger", 1, t0()),
            Err(VaultError::ContactNotFound(_))
        ));
        assert!(cycle_votes(&conn, &owner, 1).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_cycle_rejected() {
        let (mut conn, owner) = escalated();
        assert!(matches!(
            vote(&mut conn, &owner, "c1", 7, t0()),
            Err(VaultError::QuorumCycleMismatch { submitted: 7, .. })
        ));
    }

    #[test]
    fn test_alive_assertions_never_count() {
        let (mut conn, owner) = escalated();
        for contact in ["c1", "c2"] {
            TrustedContactQuorum::new()
                .submit_verification(
                    &mut conn,
                    &ContactId::from(contact),
                    &owner,
                    1,
                    Assertion::Alive,
                    t0(),
                )
                .unwrap();
        }
        let state = load_state(&conn, &owner).unwrap();
        assert_eq!(state.state, VaultState::Escalation);
    }

    #[test]
    fn test_cycles_numbered_per_owner() {
        let (conn, owner) = escalated();
        close_cycle(&conn, &owner, 1, "cancelled", t0()).unwrap();
        assert_eq!(open_cycle(&conn, &owner, t0()).unwrap(), 2);
    }
}
