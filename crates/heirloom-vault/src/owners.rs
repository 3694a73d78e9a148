//! Vault owners: provisioning, switch configuration, status and history

use crate::audit::{self, AuditRecord};
use crate::db::{self, from_opt_ts, from_ts, parse_text, to_ts, whole_seconds};
use crate::error::{Result, VaultError};
use chrono::{DateTime, Utc};
use heirloom_core::{HolderKeyRef, OwnerId};
use heirloom_inherit::heartbeat::days_until_due;
use heirloom_inherit::quorum::{tally, QuorumProgress};
use heirloom_inherit::{
    CheckInSource, PolicyError, UnlockPolicy, VaultState, VaultUnlockState,
};
use heirloom_shamir::{HolderKeys, MasterKey, SecretShareStore, ShareSet, SHARE_COUNT};
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};

/// Largest page `check_in_history` will return
pub const MAX_HISTORY_PAGE: u32 = 100;

/// The scheduler's view of an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRecord {
    pub owner_id: OwnerId,
    pub email: Option<String>,
    pub policy: UnlockPolicy,
    pub created_at: DateTime<Utc>,
    pub last_check_in_at: Option<DateTime<Utc>>,
    pub next_check_in_at: DateTime<Utc>,
    pub missed_count: u32,
    /// Lead (days) of the last upcoming-due reminder sent for `next_check_in_at`
    pub last_reminder_lead: Option<u32>,
    /// Last escalation cycle id handed out
    pub cycle_counter: i64,
    pub commitment_salt: Vec<u8>,
    pub remediation_required: bool,
}

impl OwnerRecord {
    /// Due dates are counted from here.
    pub fn check_in_anchor(&self) -> DateTime<Utc> {
        self.last_check_in_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub owner_id: OwnerId,
    pub email: Option<String>,
    pub policy: UnlockPolicy,
    /// Share holders in index order: owner device, then contact A, then
    /// contact B or the escrow key
    pub holders: [HolderKeyRef; SHARE_COUNT],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionReceipt {
    pub owner_id: OwnerId,
    pub next_check_in_at: DateTime<Utc>,
    pub version: i64,
}

/// Status as served to clients. Derived fields are for display; `unlock_at`
/// and `version` are authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockStatus {
    pub owner_id: OwnerId,
    pub state: VaultState,
    pub version: i64,
    pub unlock_at: Option<DateTime<Utc>>,
    pub cycle_id: Option<i64>,
    pub missed_count: u32,
    pub next_check_in_at: DateTime<Utc>,
    pub days_until_due: i64,
    pub quorum: QuorumProgress,
    pub remediation_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInRecord {
    pub owner_id: OwnerId,
    pub at: DateTime<Utc>,
    pub source: CheckInSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInHistory {
    pub records: Vec<CheckInRecord>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

// ============================================================================
// Loading
// ============================================================================

pub fn load_owner(conn: &Connection, owner: &OwnerId) -> Result<OwnerRecord> {
    let row = db::optional(conn.query_row(
        "SELECT owner_id, email, check_in_interval_days, grace_period_days,
                escalation_threshold, quorum_window_days, created_at, last_check_in_at,
                next_check_in_at, missed_count, last_reminder_lead, cycle_counter,
                commitment_salt, remediation_required
         FROM owners WHERE owner_id = ?1",
        params![owner.as_str()],
        |row| {
            Ok(OwnerRecord {
                owner_id: OwnerId::new(row.get::<_, String>(0)?),
                email: row.get(1)?,
                policy: UnlockPolicy {
                    check_in_interval_days: row.get(2)?,
                    grace_period_days: row.get(3)?,
                    escalation_threshold: row.get(4)?,
                    quorum_window_days: row.get(5)?,
                },
                created_at: from_ts(row.get(6)?)?,
                last_check_in_at: from_opt_ts(row.get(7)?)?,
                next_check_in_at: from_ts(row.get(8)?)?,
                missed_count: row.get(9)?,
                last_reminder_lead: row.get(10)?,
                cycle_counter: row.get(11)?,
                commitment_salt: row.get(12)?,
                remediation_required: row.get(13)?,
            })
        },
    ))?;
    row.ok_or_else(|| VaultError::OwnerNotFound(owner.clone()))
}

pub fn load_state(conn: &Connection, owner: &OwnerId) -> Result<VaultUnlockState> {
    let row = db::optional(conn.query_row(
        "SELECT state, version, unlock_at, cycle_id
         FROM vault_unlock_state WHERE owner_id = ?1",
        params![owner.as_str()],
        |row| {
            Ok(VaultUnlockState {
                state: parse_text(0, row.get(0)?)?,
                version: row.get(1)?,
                unlock_at: from_opt_ts(row.get(2)?)?,
                cycle_id: row.get(3)?,
            })
        },
    ))?;
    row.ok_or_else(|| VaultError::OwnerNotFound(owner.clone()))
}

/// The stored unlock marker, present only once the vault is unlocked.
pub fn unlock_marker(conn: &Connection, owner: &OwnerId) -> Result<Option<String>> {
    let marker = db::optional(conn.query_row(
        "SELECT unlock_marker FROM vault_unlock_state WHERE owner_id = ?1",
        params![owner.as_str()],
        |row| row.get::<_, Option<String>>(0),
    ))?;
    marker.ok_or_else(|| VaultError::OwnerNotFound(owner.clone()))
}

// ============================================================================
// Provisioning
// ============================================================================

/// Create an owner: generate the master key, split it to the three holders,
/// and write the owner, its `Alive` state row and the sealed shares.
///
/// The master key never leaves this function.
pub fn provision(
    conn: &mut Connection,
    keys: &(dyn HolderKeys + Send + Sync),
    request: &ProvisionRequest,
    now: DateTime<Utc>,
) -> Result<ProvisionReceipt> {
    request.policy.validate()?;
    let now = whole_seconds(now);

    let share_set = {
        let master = MasterKey::generate();
        SecretShareStore::new(keys)
            .split(&request.owner_id, &master, &request.holders)
            .map_err(|e| VaultError::from_shares(&request.owner_id, e))?
    };

    let receipt = db::with_transaction(conn, |tx| provision_tx(tx, request, &share_set, now))?;
    log::info!(
        "Provisioned vault for {}; first check-in due {}",
        receipt.owner_id,
        receipt.next_check_in_at
    );
    Ok(receipt)
}

fn provision_tx(
    tx: &Transaction<'_>,
    request: &ProvisionRequest,
    share_set: &ShareSet,
    now: DateTime<Utc>,
) -> Result<ProvisionReceipt> {
    let owner = &request.owner_id;
    let exists: bool = tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM owners WHERE owner_id = ?1)",
        params![owner.as_str()],
        |row| row.get(0),
    )?;
    if exists {
        return Err(VaultError::OwnerExists(owner.clone()));
    }

    let policy = &request.policy;
    let next = now + policy.check_in_interval();
    tx.execute(
        "INSERT INTO owners (owner_id, email, check_in_interval_days, grace_period_days,
            escalation_threshold, quorum_window_days, created_at, next_check_in_at,
            commitment_salt)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            owner.as_str(),
            request.email,
            policy.check_in_interval_days,
            policy.grace_period_days,
            policy.escalation_threshold,
            policy.quorum_window_days,
            to_ts(now),
            to_ts(next),
            &share_set.commitment_salt[..],
        ],
    )?;

    let initial = VaultUnlockState::initial();
    tx.execute(
        "INSERT INTO vault_unlock_state (owner_id, state, version, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            owner.as_str(),
            initial.state.as_str(),
            initial.version,
            to_ts(now)
        ],
    )?;

    for share in &share_set.shares {
        tx.execute(
            "INSERT INTO secret_shares (owner_id, share_index, holder_key_ref, ciphertext, commitment)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                owner.as_str(),
                share.index,
                share.holder.as_str(),
                share.sealed.to_bytes(),
                &share.commitment[..],
            ],
        )?;
    }

    audit::record(
        tx,
        owner,
        AuditRecord {
            action: "provisioned",
            to_state: Some(initial.state),
            version: Some(initial.version),
            ..Default::default()
        },
        now,
    )?;

    Ok(ProvisionReceipt {
        owner_id: owner.clone(),
        next_check_in_at: next,
        version: initial.version,
    })
}

// ============================================================================
// Configuration
// ============================================================================

/// Replace an owner's policy. Only allowed while the vault is `Alive`.
///
/// The next due date is recomputed from the last check-in and the missed
/// count starts over; the next sweep re-derives it under the new interval.
pub fn configure(
    conn: &mut Connection,
    owner: &OwnerId,
    policy: UnlockPolicy,
    now: DateTime<Utc>,
) -> Result<OwnerRecord> {
    policy.validate()?;
    let now = whole_seconds(now);

    db::with_transaction(conn, |tx| {
        let state = load_state(tx, owner)?;
        if state.state != VaultState::Alive {
            return Err(PolicyError::Invalid(format!(
                "switch can only be configured while the vault is alive (currently {})",
                state.state
            ))
            .into());
        }

        let record = load_owner(tx, owner)?;
        let next = record.check_in_anchor() + policy.check_in_interval();
        tx.execute(
            "UPDATE owners SET check_in_interval_days = ?2, grace_period_days = ?3,
                escalation_threshold = ?4, quorum_window_days = ?5,
                next_check_in_at = ?6, missed_count = 0, last_reminder_lead = NULL
             WHERE owner_id = ?1",
            params![
                owner.as_str(),
                policy.check_in_interval_days,
                policy.grace_period_days,
                policy.escalation_threshold,
                policy.quorum_window_days,
                to_ts(next),
            ],
        )?;

        audit::record(
            tx,
            owner,
            AuditRecord {
                action: "configured",
                detail: Some(serde_json::to_string(&policy)?),
                ..Default::default()
            },
            now,
        )?;

        log::info!(
            "Switch for {} now every {} days; next due {}",
            owner,
            policy.check_in_interval_days,
            next
        );
        load_owner(tx, owner)
    })
}

// ============================================================================
// Status & history
// ============================================================================

pub fn unlock_status(conn: &Connection, owner: &OwnerId, now: DateTime<Utc>) -> Result<UnlockStatus> {
    let record = load_owner(conn, owner)?;
    let state = load_state(conn, owner)?;

    let quorum = match state.cycle_id {
        Some(cycle_id) => tally(
            &crate::quorum::cycle_votes(conn, owner, cycle_id)?,
            record.policy.quorum_window(),
        ),
        None => QuorumProgress::empty(),
    };

    Ok(UnlockStatus {
        owner_id: owner.clone(),
        state: state.state,
        version: state.version,
        unlock_at: state.unlock_at,
        cycle_id: state.cycle_id,
        missed_count: record.missed_count,
        next_check_in_at: record.next_check_in_at,
        days_until_due: days_until_due(record.next_check_in_at, now),
        quorum,
        remediation_required: record.remediation_required,
    })
}

/// One page of the check-in log, newest first. `page` is 1-based.
pub fn check_in_history(
    conn: &Connection,
    owner: &OwnerId,
    page: u32,
    limit: u32,
) -> Result<CheckInHistory> {
    // Existence check so an unknown owner is an error, not an empty page
    load_owner(conn, owner)?;

    let page = page.max(1);
    let limit = limit.clamp(1, MAX_HISTORY_PAGE);
    let offset = i64::from(page - 1) * i64::from(limit);

    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM check_in_records WHERE owner_id = ?1",
        params![owner.as_str()],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare_cached(
        "SELECT at, source FROM check_in_records WHERE owner_id = ?1
         ORDER BY at DESC, id DESC LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt.query_map(params![owner.as_str(), limit, offset], |row| {
        Ok(CheckInRecord {
            owner_id: owner.clone(),
            at: from_ts(row.get(0)?)?,
            source: parse_text(1, row.get(1)?)?,
        })
    })?;

    Ok(CheckInHistory {
        records: rows.collect::<rusqlite::Result<Vec<_>>>()?,
        total,
        page,
        limit,
    })
}

// ============================================================================
// Remediation
// ============================================================================

/// Flag an owner after an integrity failure. Sweeps skip flagged owners.
pub(crate) fn flag_remediation(
    conn: &Connection,
    owner: &OwnerId,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let state = load_state(conn, owner)?;
    conn.execute(
        "UPDATE owners SET remediation_required = 1 WHERE owner_id = ?1",
        params![owner.as_str()],
    )?;
    audit::record(
        conn,
        owner,
        AuditRecord {
            action: "unlock_failed",
            from_state: Some(state.state),
            to_state: Some(state.state),
            version: Some(state.version),
            detail: Some(reason.to_string()),
        },
        now,
    )
}

/// Clear the remediation flag after an operator has repaired the shares.
pub fn clear_remediation(
    conn: &mut Connection,
    owner: &OwnerId,
    note: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let now = whole_seconds(now);
    db::with_transaction(conn, |tx| {
        let changed = tx.execute(
            "UPDATE owners SET remediation_required = 0
             WHERE owner_id = ?1 AND remediation_required = 1",
            params![owner.as_str()],
        )?;
        if changed == 0 {
            // Either unknown or not flagged
            load_owner(tx, owner)?;
            return Ok(());
        }
        audit::record(
            tx,
            owner,
            AuditRecord {
                action: "remediation_cleared",
                detail: Some(note.to_string()),
                ..Default::default()
            },
            now,
        )?;
        log::warn!("Remediation flag cleared for {}: {}", owner, note);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::keyring::MemoryKeyring;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> (Connection, MemoryKeyring, ProvisionRequest) {
        let conn = open_in_memory().unwrap();
        let ring = MemoryKeyring::new();
        let holders = [
            HolderKeyRef::from("alice-device"),
            HolderKeyRef::from("contact-a"),
            HolderKeyRef::from("escrow"),
        ];
        for h in &holders {
            ring.generate(h);
        }
        let request = ProvisionRequest {
            owner_id: OwnerId::from("alice"),
            email: Some("alice@example.com".into()),
            policy: UnlockPolicy::default(),
            holders,
        };
        (conn, ring, request)
    }

    #[test]
    fn test_provision_creates_owner_state_and_shares() {
        let (mut conn, ring, request) = setup();
        let receipt = provision(&mut conn, &ring, &request, t0()).unwrap();
        assert_eq!(receipt.version, 0);
        assert_eq!(receipt.next_check_in_at, t0() + Duration::days(90));

        let state = load_state(&conn, &request.owner_id).unwrap();
        assert_eq!(state, VaultUnlockState::initial());

        let shares: i64 = conn
            .query_row("SELECT COUNT(*) FROM secret_shares WHERE owner_id = 'alice'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(shares, 3);

        // Shares are write-once
        let err = conn
            .execute("UPDATE secret_shares SET commitment = x'00'", [])
            .unwrap_err();
        assert!(db::is_constraint_violation(&err));
    }

    #[test]
    fn test_provision_twice_rejected() {
        let (mut conn, ring, request) = setup();
        provision(&mut conn, &ring, &request, t0()).unwrap();
        assert!(matches!(
            provision(&mut conn, &ring, &request, t0()),
            Err(VaultError::OwnerExists(_))
        ));
    }

    #[test]
    fn test_provision_needs_every_holder_key() {
        let (mut conn, ring, request) = setup();
        ring.remove(&request.holders[2]);
        assert!(matches!(
            provision(&mut conn, &ring, &request, t0()),
            Err(VaultError::Shares(_))
        ));
        assert!(load_owner(&conn, &request.owner_id).is_err());
    }

    #[test]
    fn test_configure_recomputes_due_date() {
        let (mut conn, ring, request) = setup();
        provision(&mut conn, &ring, &request, t0()).unwrap();

        let policy = UnlockPolicy::default().with_interval(30).unwrap();
        let record = configure(&mut conn, &request.owner_id, policy, t0()).unwrap();
        assert_eq!(record.policy.check_in_interval_days, 30);
        assert_eq!(record.next_check_in_at, t0() + Duration::days(30));
    }

    #[test]
    fn test_configure_rejects_invalid_policy() {
        let (mut conn, ring, request) = setup();
        provision(&mut conn, &ring, &request, t0()).unwrap();
        let bad = UnlockPolicy {
            grace_period_days: 0,
            ..UnlockPolicy::default()
        };
        assert!(matches!(
            configure(&mut conn, &request.owner_id, bad, t0()),
            Err(VaultError::Policy(_))
        ));
    }

    #[test]
    fn test_status_for_fresh_vault() {
        let (mut conn, ring, request) = setup();
        provision(&mut conn, &ring, &request, t0()).unwrap();

        let status = unlock_status(&conn, &request.owner_id, t0() + Duration::days(80)).unwrap();
        assert_eq!(status.state, VaultState::Alive);
        assert_eq!(status.days_until_due, 10);
        assert_eq!(status.quorum, QuorumProgress::empty());
        assert!(status.unlock_at.is_none());

        assert!(matches!(
            unlock_status(&conn, &OwnerId::from("nobody"), t0()),
            Err(VaultError::OwnerNotFound(_))
        ));
    }

    #[test]
    fn test_history_paging() {
        let (mut conn, ring, request) = setup();
        provision(&mut conn, &ring, &request, t0()).unwrap();
        for day in 0..5 {
            conn.execute(
                "INSERT INTO check_in_records (owner_id, at, source) VALUES ('alice', ?1, 'manual')",
                params![to_ts(t0() + Duration::days(day))],
            )
            .unwrap();
        }

        let first = check_in_history(&conn, &request.owner_id, 1, 2).unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.records[0].at, t0() + Duration::days(4));
        assert_eq!(first.records[0].source, CheckInSource::Manual);

        let last = check_in_history(&conn, &request.owner_id, 3, 2).unwrap();
        assert_eq!(last.records.len(), 1);
        assert_eq!(last.records[0].at, t0());
    }

    #[test]
    fn test_remediation_flag_roundtrip() {
        let (mut conn, ring, request) = setup();
        provision(&mut conn, &ring, &request, t0()).unwrap();

        flag_remediation(&conn, &request.owner_id, "share 2 commitment mismatch", t0()).unwrap();
        assert!(load_owner(&conn, &request.owner_id).unwrap().remediation_required);

        clear_remediation(&mut conn, &request.owner_id, "shares re-issued", t0()).unwrap();
        assert!(!load_owner(&conn, &request.owner_id).unwrap().remediation_required);

        let actions: Vec<String> = audit::entries(&conn, &request.owner_id)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["provisioned", "unlock_failed", "remediation_cleared"]);
    }
}
