//! Trusted-contact enrollment
//!
//! A contact only counts toward a quorum once it has confirmed its own
//! enrollment. The out-of-band identity check behind that confirmation is not
//! done here; `confirm_contact` records its result.

use crate::audit::{self, AuditRecord};
use crate::db::{self, from_opt_ts, from_ts, to_ts, whole_seconds};
use crate::error::{Result, VaultError};
use crate::outbox;
use crate::owners::load_owner;
use chrono::{DateTime, Utc};
use heirloom_core::{ContactId, OwnerId};
use heirloom_inherit::quorum::MAX_CONTACTS;
use heirloom_inherit::{NotificationKind, PolicyError};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedContact {
    pub contact_id: ContactId,
    pub owner_id: OwnerId,
    /// Opaque reference to how the contact proves who they are
    pub identity_ref: String,
    pub email: Option<String>,
    pub enrolled_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl TrustedContact {
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            contact_id: ContactId::new(row.get::<_, String>(0)?),
            owner_id: OwnerId::new(row.get::<_, String>(1)?),
            identity_ref: row.get(2)?,
            email: row.get(3)?,
            enrolled_at: from_ts(row.get(4)?)?,
            confirmed_at: from_opt_ts(row.get(5)?)?,
        })
    }
}

const CONTACT_COLUMNS: &str =
    "contact_id, owner_id, identity_ref, email, enrolled_at, confirmed_at";

pub fn enroll_contact(
    conn: &mut Connection,
    owner: &OwnerId,
    contact: &ContactId,
    identity_ref: &str,
    email: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TrustedContact> {
    db::with_transaction(conn, |tx| {
        enroll_contact_tx(tx, owner, contact, identity_ref, email, now)
    })
}

pub fn enroll_contact_tx(
    conn: &Connection,
    owner: &OwnerId,
    contact: &ContactId,
    identity_ref: &str,
    email: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TrustedContact> {
    let now = whole_seconds(now);
    load_owner(conn, owner)?;

    if identity_ref.trim().is_empty() {
        return Err(PolicyError::Invalid("contact identity reference is empty".into()).into());
    }

    let enrolled: i64 = conn.query_row(
        "SELECT COUNT(*) FROM trusted_contacts WHERE owner_id = ?1",
        params![owner.as_str()],
        |row| row.get(0),
    )?;
    if enrolled >= MAX_CONTACTS as i64 {
        return Err(PolicyError::Invalid(format!(
            "owner {} already has {} trusted contacts",
            owner, MAX_CONTACTS
        ))
        .into());
    }

    let inserted = conn.execute(
        "INSERT INTO trusted_contacts (contact_id, owner_id, identity_ref, email, enrolled_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            contact.as_str(),
            owner.as_str(),
            identity_ref,
            email,
            to_ts(now)
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(e) if db::is_constraint_violation(&e) => {
            return Err(PolicyError::Invalid(format!("contact {} is already enrolled", contact)).into())
        }
        Err(e) => return Err(e.into()),
    }

    audit::record(
        conn,
        owner,
        AuditRecord {
            action: "contact_enrolled",
            detail: Some(contact.to_string()),
            ..Default::default()
        },
        now,
    )?;
    if let Some(address) = email {
        outbox::enqueue(
            conn,
            owner,
            address,
            NotificationKind::ContactInvitation,
            &json!({ "contact_id": contact, "owner_id": owner }),
            now,
        )?;
    }

    log::info!("Enrolled contact {} for {}", contact, owner);
    Ok(TrustedContact {
        contact_id: contact.clone(),
        owner_id: owner.clone(),
        identity_ref: identity_ref.to_string(),
        email: email.map(str::to_string),
        enrolled_at: now,
        confirmed_at: None,
    })
}

/// Record that `contact` confirmed its enrollment. Confirming twice keeps the
/// first confirmation time.
pub fn confirm_contact(
    conn: &mut Connection,
    contact: &ContactId,
    at: DateTime<Utc>,
) -> Result<TrustedContact> {
    db::with_transaction(conn, |tx| confirm_contact_tx(tx, contact, at))
}

pub fn confirm_contact_tx(
    conn: &Connection,
    contact: &ContactId,
    at: DateTime<Utc>,
) -> Result<TrustedContact> {
    let at = whole_seconds(at);
    let changed = conn.execute(
        "UPDATE trusted_contacts SET confirmed_at = ?2
         WHERE contact_id = ?1 AND confirmed_at IS NULL",
        params![contact.as_str(), to_ts(at)],
    )?;

    let record = load_contact(conn, contact)?;
    if changed > 0 {
        audit::record(
            conn,
            &record.owner_id,
            AuditRecord {
                action: "contact_confirmed",
                detail: Some(contact.to_string()),
                ..Default::default()
            },
            at,
        )?;
        log::info!("Contact {} confirmed for {}", contact, record.owner_id);
    }
    Ok(record)
}

pub fn load_contact(conn: &Connection, contact: &ContactId) -> Result<TrustedContact> {
    let sql = format!(
        "SELECT {} FROM trusted_contacts WHERE contact_id = ?1",
        CONTACT_COLUMNS
    );
    db::optional(conn.query_row(&sql, params![contact.as_str()], TrustedContact::from_row))?
        .ok_or_else(|| VaultError::ContactNotFound(contact.clone()))
}

pub fn list_contacts(conn: &Connection, owner: &OwnerId) -> Result<Vec<TrustedContact>> {
    load_owner(conn, owner)?;
    let sql = format!(
        "SELECT {} FROM trusted_contacts WHERE owner_id = ?1 ORDER BY enrolled_at, contact_id",
        CONTACT_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![owner.as_str()], TrustedContact::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// How many of `owner`'s contacts can vote.
pub fn confirmed_count(conn: &Connection, owner: &OwnerId) -> Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM trusted_contacts WHERE owner_id = ?1 AND confirmed_at IS NOT NULL",
        params![owner.as_str()],
        |row| row.get(0),
    )?;
    usize::try_from(n).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(0, n).into())
}
