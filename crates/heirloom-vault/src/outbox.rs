//! Notification outbox
//!
//! Notifications are queued in the same transaction as the state change that
//! caused them, so a rolled-back transition never sends anything and a
//! committed one is never silently forgotten. Delivery happens later, outside
//! any transaction; failures are recorded here and never reach the state
//! machine.

use crate::db::{from_ts, to_ts};
use crate::error::Result;
use chrono::{DateTime, Utc};
use heirloom_core::OwnerId;
use heirloom_inherit::NotificationKind;
use rusqlite::{params, Connection};
use serde::Serialize;

/// Give up on a message after this many failed deliveries
pub const MAX_DELIVERY_ATTEMPTS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxMessage {
    pub id: i64,
    pub owner_id: OwnerId,
    /// Address resolved when the message was queued
    pub recipient: String,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempts: i64,
}

/// Queue one message to an explicit address.
pub fn enqueue(
    conn: &Connection,
    owner: &OwnerId,
    recipient: &str,
    kind: NotificationKind,
    payload: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO notification_outbox (owner_id, recipient, kind, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            owner.as_str(),
            recipient,
            kind.as_str(),
            serde_json::to_string(payload)?,
            to_ts(now)
        ],
    )?;
    Ok(())
}

/// Queue a message to the owner. Returns `false` if the owner has no address.
pub fn enqueue_owner(
    conn: &Connection,
    owner: &OwnerId,
    kind: NotificationKind,
    payload: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<bool> {
    let email: Option<String> = conn
        .query_row(
            "SELECT email FROM owners WHERE owner_id = ?1",
            params![owner.as_str()],
            |row| row.get(0),
        )
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(e),
        })?;

    match email {
        Some(address) => {
            enqueue(conn, owner, &address, kind, payload, now)?;
            Ok(true)
        }
        None => {
            log::debug!("No address for owner {}; skipping {}", owner, kind);
            Ok(false)
        }
    }
}

/// Queue a message to every confirmed contact of `owner` that has an address.
/// Returns how many were queued.
pub fn enqueue_confirmed_contacts(
    conn: &Connection,
    owner: &OwnerId,
    kind: NotificationKind,
    payload: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<usize> {
    let addresses: Vec<String> = {
        let mut stmt = conn.prepare_cached(
            "SELECT email FROM trusted_contacts
             WHERE owner_id = ?1 AND confirmed_at IS NOT NULL AND email IS NOT NULL
             ORDER BY contact_id",
        )?;
        let rows = stmt.query_map(params![owner.as_str()], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    for address in &addresses {
        enqueue(conn, owner, address, kind, payload, now)?;
    }
    Ok(addresses.len())
}

/// Undelivered messages that still have attempts left, oldest first.
pub fn pending(conn: &Connection, limit: usize) -> Result<Vec<OutboxMessage>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, owner_id, recipient, kind, payload, created_at, attempts
         FROM notification_outbox
         WHERE delivered_at IS NULL AND attempts < ?1
         ORDER BY id LIMIT ?2",
    )?;
    let rows = stmt.query_map(
        params![MAX_DELIVERY_ATTEMPTS, limit as i64],
        |row| {
            let kind: String = row.get(3)?;
            let payload: String = row.get(4)?;
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                kind,
                payload,
                from_ts(row.get(5)?)?,
                row.get::<_, i64>(6)?,
            ))
        },
    )?;

    let mut messages = Vec::new();
    for row in rows {
        let (id, owner_id, recipient, kind, payload, created_at, attempts) = row?;
        let kind = match kind.parse::<NotificationKind>() {
            Ok(kind) => kind,
            Err(e) => {
                log::warn!("Skipping outbox message {}: {}", id, e);
                continue;
            }
        };
        messages.push(OutboxMessage {
            id,
            owner_id: OwnerId::new(owner_id),
            recipient,
            kind,
            payload: serde_json::from_str(&payload)?,
            created_at,
            attempts,
        });
    }
    Ok(messages)
}

pub fn mark_delivered(conn: &Connection, id: i64, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE notification_outbox SET delivered_at = ?2, attempts = attempts + 1
         WHERE id = ?1",
        params![id, to_ts(now)],
    )?;
    Ok(())
}

pub fn mark_failed(conn: &Connection, id: i64, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE notification_outbox SET attempts = attempts + 1, last_error = ?2
         WHERE id = ?1",
        params![id, error],
    )?;
    Ok(())
}

/// Messages queued for `owner` (delivered or not), oldest first.
pub fn for_owner(conn: &Connection, owner: &OwnerId) -> Result<Vec<(String, NotificationKind)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT recipient, kind FROM notification_outbox WHERE owner_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![owner.as_str()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (recipient, kind) = row?;
        if let Ok(kind) = kind.parse() {
            out.push((recipient, kind));
        }
    }
    Ok(out)
}
