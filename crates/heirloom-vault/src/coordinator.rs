//! Unlock coordination
//!
//! [`apply_transition`] is the only code that writes `vault_unlock_state`.
//! It checks the transition table, then compare-and-swaps on
//! `(owner_id, state, version)` and audits the result. Every component
//! reaches the state machine through it, inside its own transaction.
//!
//! [`UnlockCoordinator`] drives the final `PendingUnlock -> Unlocked` step:
//! it reconstructs the master key, derives the unlock marker, and commits the
//! marker together with the new state. A share integrity failure aborts the
//! transition, flags the owner for remediation and is returned as fatal.

use crate::audit::{self, AuditRecord};
use crate::db::{self, from_ts, to_ts, whole_seconds};
use crate::error::{Result, VaultError};
use crate::keyring::SharedKeyring;
use crate::outbox;
use crate::owners::{self, load_owner, load_state};
use crate::quorum;
use chrono::{DateTime, Utc};
use heirloom_core::{HolderKeyRef, OwnerId, SealedShare};
use heirloom_inherit::state::next_state;
use heirloom_inherit::{NotificationKind, Trigger, VaultState, VaultUnlockState};
use heirloom_shamir::shares::COMMITMENT_LEN;
use heirloom_shamir::{SecretShare, SecretShareStore};
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// A requested state change with the data it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// `Alive -> Escalation`, opening `cycle_id`
    Escalate { cycle_id: i64 },
    /// `Escalation -> PendingUnlock`
    VerifyDeath {
        quorum_reached_at: DateTime<Utc>,
        unlock_at: DateTime<Utc>,
    },
    /// Any non-terminal state `-> Alive`; cancels cycle and grace timer
    CheckIn,
    /// `PendingUnlock -> Unlocked`
    Unlock { marker: String },
}

impl Transition {
    pub fn trigger(&self) -> Trigger {
        match self {
            Transition::Escalate { .. } => Trigger::MissedThreshold,
            Transition::VerifyDeath { .. } => Trigger::DeathVerified,
            Transition::CheckIn => Trigger::CheckIn,
            Transition::Unlock { .. } => Trigger::GraceElapsed,
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Transition::Escalate { .. } => "escalation_triggered",
            Transition::VerifyDeath { .. } => "death_verified",
            Transition::CheckIn => "escalation_cancelled",
            Transition::Unlock { .. } => "unlocked",
        }
    }
}

/// Apply `transition` to the state row last read as `current`.
///
/// Fails with [`VaultError::ConcurrentTransitionConflict`] if the row moved on
/// since it was read; callers retry with a fresh read.
pub fn apply_transition(
    conn: &Connection,
    owner: &OwnerId,
    current: &VaultUnlockState,
    transition: &Transition,
    now: DateTime<Utc>,
) -> Result<VaultUnlockState> {
    let to = next_state(current, transition.trigger(), now)?;

    let (unlock_at, cycle_id) = match transition {
        Transition::Escalate { cycle_id } => (None, Some(*cycle_id)),
        Transition::VerifyDeath { unlock_at, .. } => (Some(*unlock_at), current.cycle_id),
        Transition::CheckIn => (None, None),
        Transition::Unlock { .. } => (current.unlock_at, current.cycle_id),
    };
    let next = VaultUnlockState {
        state: to,
        version: current.version + 1,
        unlock_at,
        cycle_id,
    };

    let changed = conn.execute(
        "UPDATE vault_unlock_state
         SET state = ?4, version = ?5, unlock_at = ?6, cycle_id = ?7, updated_at = ?8
         WHERE owner_id = ?1 AND state = ?2 AND version = ?3",
        params![
            owner.as_str(),
            current.state.as_str(),
            current.version,
            next.state.as_str(),
            next.version,
            next.unlock_at.map(to_ts),
            next.cycle_id,
            to_ts(now),
        ],
    )?;
    if changed == 0 {
        log::debug!(
            "CAS miss for {} at {} v{} ({})",
            owner,
            current.state,
            current.version,
            transition.trigger()
        );
        return Err(VaultError::ConcurrentTransitionConflict {
            owner: owner.clone(),
            expected_version: current.version,
        });
    }

    match transition {
        Transition::VerifyDeath {
            quorum_reached_at, ..
        } => {
            conn.execute(
                "UPDATE vault_unlock_state SET quorum_reached_at = ?2 WHERE owner_id = ?1",
                params![owner.as_str(), to_ts(*quorum_reached_at)],
            )?;
        }
        Transition::CheckIn | Transition::Escalate { .. } => {
            conn.execute(
                "UPDATE vault_unlock_state SET quorum_reached_at = NULL WHERE owner_id = ?1",
                params![owner.as_str()],
            )?;
        }
        Transition::Unlock { marker } => {
            conn.execute(
                "UPDATE vault_unlock_state SET unlock_marker = ?2 WHERE owner_id = ?1",
                params![owner.as_str(), marker],
            )?;
        }
    }

    let detail = match transition {
        Transition::Escalate { cycle_id } => Some(format!("cycle {}", cycle_id)),
        Transition::VerifyDeath { unlock_at, .. } => Some(format!("unlock_at {}", unlock_at)),
        Transition::CheckIn => current.cycle_id.map(|c| format!("cancelled cycle {}", c)),
        Transition::Unlock { .. } => None,
    };
    audit::record(
        conn,
        owner,
        AuditRecord {
            action: transition.action(),
            from_state: Some(current.state),
            to_state: Some(next.state),
            version: Some(next.version),
            detail,
        },
        now,
    )?;

    log::info!(
        "Vault {}: {} -> {} (version {})",
        owner,
        current.state,
        next.state,
        next.version
    );
    Ok(next)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnlockOutcome {
    Unlocked {
        version: i64,
    },
    AlreadyUnlocked,
    /// Not in `PendingUnlock`, or the grace period is still running
    NotDue {
        state: VaultState,
        unlock_at: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnlockFailure {
    pub owner_id: OwnerId,
    pub error: String,
    /// Integrity failure; the owner is now flagged for remediation
    pub fatal: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnlockSweep {
    pub unlocked: Vec<OwnerId>,
    pub failed: Vec<UnlockFailure>,
}

/// Drives `PendingUnlock -> Unlocked` with key reconstruction.
#[derive(Clone)]
pub struct UnlockCoordinator {
    keys: SharedKeyring,
}

impl UnlockCoordinator {
    pub fn new(keys: SharedKeyring) -> Self {
        Self { keys }
    }

    /// Unlock `owner` if its grace period has elapsed.
    ///
    /// Exactly once: a second call (or a racing coordinator) sees
    /// `AlreadyUnlocked`. On a share integrity failure nothing about the state
    /// changes, the owner is flagged, and the error is returned.
    pub fn unlock(
        &self,
        conn: &mut Connection,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> Result<UnlockOutcome> {
        let now = whole_seconds(now);
        match db::with_transaction(conn, |tx| self.unlock_tx(tx, owner, now)) {
            Err(e @ VaultError::InvalidShare { .. }) => {
                log::error!(
                    "Unlock of {} aborted, MANUAL REMEDIATION REQUIRED: {}",
                    owner,
                    e
                );
                let reason = e.to_string();
                db::with_transaction(conn, |tx| {
                    owners::flag_remediation(tx, owner, &reason, now)
                })?;
                Err(e)
            }
            other => other,
        }
    }

    fn unlock_tx(
        &self,
        tx: &Transaction<'_>,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> Result<UnlockOutcome> {
        let state = load_state(tx, owner)?;
        match state.state {
            VaultState::Unlocked => return Ok(UnlockOutcome::AlreadyUnlocked),
            VaultState::PendingUnlock if state.grace_elapsed(now) => {}
            _ => {
                return Ok(UnlockOutcome::NotDue {
                    state: state.state,
                    unlock_at: state.unlock_at,
                })
            }
        }

        let record = load_owner(tx, owner)?;
        if record.remediation_required {
            return Err(VaultError::RemediationRequired(owner.clone()));
        }

        let shares = load_shares(tx, owner)?;
        let marker = {
            let master = SecretShareStore::new(&*self.keys)
                .reconstruct(owner, &record.commitment_salt, &shares)
                .map_err(|e| VaultError::from_shares(owner, e))?;
            master
                .unlock_marker(owner)
                .map_err(|e| VaultError::from_shares(owner, e))?
        };

        let next = apply_transition(tx, owner, &state, &Transition::Unlock { marker }, now)?;

        if let Some(cycle_id) = state.cycle_id {
            quorum::close_cycle(tx, owner, cycle_id, "unlocked", now)?;
        }
        outbox::enqueue_confirmed_contacts(
            tx,
            owner,
            NotificationKind::VaultUnlocked,
            &json!({ "owner_id": owner, "unlocked_at": now }),
            now,
        )?;

        Ok(UnlockOutcome::Unlocked {
            version: next.version,
        })
    }

    /// Unlock every owner whose grace period has run out.
    ///
    /// One owner's failure does not stop the others; failures are reported in
    /// the returned sweep.
    pub fn advance_pending_unlocks(
        &self,
        conn: &mut Connection,
        now: DateTime<Utc>,
    ) -> Result<UnlockSweep> {
        let now = whole_seconds(now);
        let due: Vec<OwnerId> = {
            let mut stmt = conn.prepare_cached(
                "SELECT s.owner_id FROM vault_unlock_state s
                 JOIN owners o ON o.owner_id = s.owner_id
                 WHERE s.state = 'pending_unlock' AND s.unlock_at <= ?1
                   AND o.remediation_required = 0
                 ORDER BY s.unlock_at",
            )?;
            let rows = stmt.query_map(params![to_ts(now)], |row| {
                Ok(OwnerId::new(row.get::<_, String>(0)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut sweep = UnlockSweep::default();
        for owner in due {
            match self.unlock(conn, &owner, now) {
                Ok(UnlockOutcome::Unlocked { .. }) => sweep.unlocked.push(owner),
                Ok(_) => {}
                Err(e) => {
                    if !e.is_fatal() {
                        log::error!("Unlock of {} failed: {}", owner, e);
                    }
                    sweep.failed.push(UnlockFailure {
                        owner_id: owner,
                        fatal: e.is_fatal(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(sweep)
    }
}

/// Sealed shares for `owner`. Rows that cannot even be parsed are skipped and
/// logged; reconstruction then fails closed if too few remain.
pub fn load_shares(conn: &Connection, owner: &OwnerId) -> Result<Vec<SecretShare>> {
    let mut stmt = conn.prepare_cached(
        "SELECT share_index, holder_key_ref, ciphertext, commitment
         FROM secret_shares WHERE owner_id = ?1 ORDER BY share_index",
    )?;
    let rows = stmt.query_map(params![owner.as_str()], |row| {
        Ok((
            row.get::<_, u8>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Vec<u8>>(2)?,
            row.get::<_, Vec<u8>>(3)?,
        ))
    })?;

    let mut shares = Vec::new();
    for row in rows {
        let (index, holder, ciphertext, commitment) = row?;
        let sealed = match SealedShare::from_bytes(&ciphertext) {
            Ok(sealed) => sealed,
            Err(e) => {
                log::warn!("Share {} of {} is unreadable: {}", index, owner, e);
                continue;
            }
        };
        let commitment: [u8; COMMITMENT_LEN] = match commitment.try_into() {
            Ok(c) => c,
            Err(_) => {
                log::warn!("Share {} of {} has a malformed commitment", index, owner);
                continue;
            }
        };
        shares.push(SecretShare {
            owner_id: owner.clone(),
            index,
            holder: HolderKeyRef::new(holder),
            sealed,
            commitment,
        });
    }
    Ok(shares)
}

/// When the vault was unlocked, from the audit trail.
pub fn unlocked_at(conn: &Connection, owner: &OwnerId) -> Result<Option<DateTime<Utc>>> {
    let at = db::optional(conn.query_row(
        "SELECT at FROM audit_log WHERE owner_id = ?1 AND action = 'unlocked'
         ORDER BY id LIMIT 1",
        params![owner.as_str()],
        |row| row.get::<_, i64>(0),
    ))?;
    Ok(at.map(from_ts).transpose()?)
}
