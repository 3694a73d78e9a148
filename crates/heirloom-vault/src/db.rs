//! SQLite persistence layer.
//!
//! One connection per component call site or worker; nothing is global.
//! Every write goes through [`with_transaction`], which takes the write lock
//! up front (`BEGIN IMMEDIATE`) and retries a bounded number of times on CAS
//! conflicts or a busy database.

use crate::error::{Result, VaultError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

/// Attempts per operation before a conflict is surfaced to the caller
pub const MAX_CAS_RETRIES: usize = 3;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Open (or create) the database at `path` and run migrations.
pub fn open_db(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;

    // WAL so sweeps on other connections don't block readers
    conn.pragma_update(None, "journal_mode", "WAL")?;
    configure(&conn)?;
    migrate(&conn)?;

    Ok(conn)
}

/// In-memory database, for tests and tooling.
pub fn open_in_memory() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrate(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS owners (
            owner_id               TEXT PRIMARY KEY,
            email                  TEXT,
            check_in_interval_days INTEGER NOT NULL,
            grace_period_days      INTEGER NOT NULL,
            escalation_threshold   INTEGER NOT NULL,
            quorum_window_days     INTEGER NOT NULL,
            created_at             INTEGER NOT NULL,
            last_check_in_at       INTEGER,
            next_check_in_at       INTEGER NOT NULL,
            missed_count           INTEGER NOT NULL DEFAULT 0,
            last_reminder_lead     INTEGER,
            cycle_counter          INTEGER NOT NULL DEFAULT 0,
            commitment_salt        BLOB NOT NULL,
            remediation_required   INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS vault_unlock_state (
            owner_id          TEXT PRIMARY KEY REFERENCES owners(owner_id),
            state             TEXT NOT NULL,
            version           INTEGER NOT NULL,
            unlock_at         INTEGER,
            cycle_id          INTEGER,
            quorum_reached_at INTEGER,
            unlock_marker     TEXT,
            updated_at        INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS check_in_records (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id    TEXT NOT NULL REFERENCES owners(owner_id),
            at          INTEGER NOT NULL,
            source      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_check_in_owner ON check_in_records(owner_id, at);

        CREATE TABLE IF NOT EXISTS trusted_contacts (
            contact_id   TEXT PRIMARY KEY,
            owner_id     TEXT NOT NULL REFERENCES owners(owner_id),
            identity_ref TEXT NOT NULL,
            email        TEXT,
            enrolled_at  INTEGER NOT NULL,
            confirmed_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_contacts_owner ON trusted_contacts(owner_id);

        CREATE TABLE IF NOT EXISTS escalation_cycles (
            owner_id  TEXT NOT NULL REFERENCES owners(owner_id),
            cycle_id  INTEGER NOT NULL,
            opened_at INTEGER NOT NULL,
            closed_at INTEGER,
            outcome   TEXT,
            PRIMARY KEY (owner_id, cycle_id)
        );

        CREATE TABLE IF NOT EXISTS verification_attempts (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            contact_id   TEXT NOT NULL REFERENCES trusted_contacts(contact_id),
            owner_id     TEXT NOT NULL REFERENCES owners(owner_id),
            cycle_id     INTEGER NOT NULL,
            submitted_at INTEGER NOT NULL,
            assertion    TEXT NOT NULL,
            UNIQUE (contact_id, owner_id, cycle_id)
        );

        CREATE TABLE IF NOT EXISTS secret_shares (
            owner_id       TEXT NOT NULL REFERENCES owners(owner_id),
            share_index    INTEGER NOT NULL CHECK (share_index BETWEEN 1 AND 3),
            holder_key_ref TEXT NOT NULL,
            ciphertext     BLOB NOT NULL,
            commitment     BLOB NOT NULL,
            PRIMARY KEY (owner_id, share_index)
        );

        CREATE TABLE IF NOT EXISTS legacy_tokens (
            token_hash       TEXT PRIMARY KEY,
            owner_id         TEXT NOT NULL REFERENCES owners(owner_id),
            created_at       INTEGER NOT NULL,
            expires_at       INTEGER NOT NULL,
            max_redemptions  INTEGER NOT NULL CHECK (max_redemptions >= 1),
            redemption_count INTEGER NOT NULL DEFAULT 0,
            CHECK (redemption_count >= 0 AND redemption_count <= max_redemptions)
        );

        CREATE TABLE IF NOT EXISTS idempotency_keys (
            key         TEXT PRIMARY KEY,
            operation   TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            response    TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS notification_outbox (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id     TEXT NOT NULL,
            recipient    TEXT NOT NULL,
            kind         TEXT NOT NULL,
            payload      TEXT NOT NULL,
            created_at   INTEGER NOT NULL,
            attempts     INTEGER NOT NULL DEFAULT 0,
            delivered_at INTEGER,
            last_error   TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_outbox_pending
            ON notification_outbox(delivered_at, id);

        CREATE TABLE IF NOT EXISTS audit_log (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id   TEXT NOT NULL,
            action     TEXT NOT NULL,
            from_state TEXT,
            to_state   TEXT,
            version    INTEGER,
            detail     TEXT,
            at         INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_owner ON audit_log(owner_id, id);
        ",
    )?;

    migrate_idempotency_fingerprint(conn)?;

    // Append-only and write-once tables
    conn.execute_batch(
        "
        CREATE TRIGGER IF NOT EXISTS check_in_records_no_update
            BEFORE UPDATE ON check_in_records
            BEGIN SELECT RAISE(ABORT, 'check-in records are append-only'); END;
        CREATE TRIGGER IF NOT EXISTS check_in_records_no_delete
            BEFORE DELETE ON check_in_records
            BEGIN SELECT RAISE(ABORT, 'check-in records are append-only'); END;

        CREATE TRIGGER IF NOT EXISTS verification_attempts_no_update
            BEFORE UPDATE ON verification_attempts
            BEGIN SELECT RAISE(ABORT, 'verification attempts are append-only'); END;
        CREATE TRIGGER IF NOT EXISTS verification_attempts_no_delete
            BEFORE DELETE ON verification_attempts
            BEGIN SELECT RAISE(ABORT, 'verification attempts are append-only'); END;

        CREATE TRIGGER IF NOT EXISTS secret_shares_no_update
            BEFORE UPDATE ON secret_shares
            BEGIN SELECT RAISE(ABORT, 'secret shares are immutable'); END;

        CREATE TRIGGER IF NOT EXISTS audit_log_no_update
            BEFORE UPDATE ON audit_log
            BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;
        ",
    )?;

    Ok(())
}

/// Keys stored before request fingerprints existed match no request.
fn migrate_idempotency_fingerprint(conn: &Connection) -> rusqlite::Result<()> {
    let has_fingerprint = conn
        .prepare("SELECT fingerprint FROM idempotency_keys LIMIT 0")
        .is_ok();
    if !has_fingerprint {
        conn.execute_batch(
            "ALTER TABLE idempotency_keys ADD COLUMN fingerprint TEXT NOT NULL DEFAULT '';",
        )?;
    }
    Ok(())
}

/// Run `f` inside a `BEGIN IMMEDIATE` transaction and commit on success.
///
/// Any error rolls back. Retryable errors (CAS conflict, busy database) are
/// retried with a fresh transaction up to [`MAX_CAS_RETRIES`] attempts.
pub fn with_transaction<T, F>(conn: &mut Connection, mut f: F) -> Result<T>
where
    F: FnMut(&Transaction<'_>) -> Result<T>,
{
    let mut attempt = 1;
    loop {
        match run_once(conn, &mut f) {
            Err(e) if e.is_retryable() && attempt < MAX_CAS_RETRIES => {
                log::debug!(
                    "Retrying after {} (attempt {}/{})",
                    e,
                    attempt,
                    MAX_CAS_RETRIES
                );
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn run_once<T, F>(conn: &mut Connection, f: &mut F) -> Result<T>
where
    F: FnMut(&Transaction<'_>) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

// ============================================================================
// Timestamps (unix seconds)
// ============================================================================

pub fn to_ts(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

pub fn from_ts(secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, secs))
}

pub fn from_opt_ts(secs: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    secs.map(from_ts).transpose()
}

/// Drop sub-second precision so values compare equal after a round trip.
pub fn whole_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

/// Parse a TEXT column into one of the string-backed enums.
pub fn parse_text<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            )),
        )
    })
}

/// Whether `err` is a UNIQUE / CHECK / trigger constraint failure.
pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Convenience: map a missing row to `None`.
pub fn optional<T>(result: rusqlite::Result<T>) -> rusqlite::Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}
