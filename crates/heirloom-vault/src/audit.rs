//! Append-only audit log of committed transitions and unlock failures

use crate::db::{from_ts, to_ts};
use crate::error::Result;
use chrono::{DateTime, Utc};
use heirloom_core::OwnerId;
use heirloom_inherit::VaultState;
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub owner_id: OwnerId,
    pub action: String,
    pub from_state: Option<String>,
    pub to_state: Option<String>,
    pub version: Option<i64>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Everything about one audit row except its id and owner.
#[derive(Debug, Clone, Default)]
pub struct AuditRecord<'a> {
    pub action: &'a str,
    pub from_state: Option<VaultState>,
    pub to_state: Option<VaultState>,
    pub version: Option<i64>,
    pub detail: Option<String>,
}

pub fn record(
    conn: &Connection,
    owner: &OwnerId,
    entry: AuditRecord<'_>,
    at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log (owner_id, action, from_state, to_state, version, detail, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            owner.as_str(),
            entry.action,
            entry.from_state.map(|s| s.as_str()),
            entry.to_state.map(|s| s.as_str()),
            entry.version,
            entry.detail,
            to_ts(at)
        ],
    )?;
    Ok(())
}

/// Audit entries for one owner, oldest first.
pub fn entries(conn: &Connection, owner: &OwnerId) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, owner_id, action, from_state, to_state, version, detail, at
         FROM audit_log WHERE owner_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![owner.as_str()], |row| {
        Ok(AuditEntry {
            id: row.get(0)?,
            owner_id: OwnerId::new(row.get::<_, String>(1)?),
            action: row.get(2)?,
            from_state: row.get(3)?,
            to_state: row.get(4)?,
            version: row.get(5)?,
            detail: row.get(6)?,
            at: from_ts(row.get(7)?)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
