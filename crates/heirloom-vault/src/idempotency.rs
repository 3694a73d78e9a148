//! Idempotency keys for mutating operations
//!
//! The first successful response under a key is stored as JSON next to a
//! SHA-256 fingerprint of the operation and its request parameters. A retry
//! with the same key and the same request gets that response back without the
//! operation running again. Reusing a key for any other request is rejected.
//! Errors are not stored, so a failed call can be retried under the same key.

use crate::db::to_ts;
use crate::error::Result;
use chrono::{DateTime, Utc};
use heirloom_inherit::PolicyError;
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

const MAX_KEY_LEN: usize = 128;

/// Hex SHA-256 over the operation name and the JSON form of its request.
pub fn fingerprint<R: Serialize + ?Sized>(operation: &str, request: &R) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(request)?);
    Ok(hex::encode(hasher.finalize()))
}

/// Look up a stored response.
///
/// Fails with a policy error if `key` was used for a different operation or
/// a different request.
pub fn lookup<T: DeserializeOwned>(
    conn: &Connection,
    key: &str,
    operation: &str,
    fingerprint: &str,
) -> Result<Option<T>> {
    validate_key(key)?;

    let row = crate::db::optional(conn.query_row(
        "SELECT operation, fingerprint, response FROM idempotency_keys WHERE key = ?1",
        params![key],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        },
    ))?;

    match row {
        None => Ok(None),
        Some((stored_op, _, _)) if stored_op != operation => Err(PolicyError::Invalid(format!(
            "idempotency key already used for {}",
            stored_op
        ))
        .into()),
        Some((_, stored, _)) if stored != fingerprint => Err(PolicyError::Invalid(
            "idempotency key already used with a different request".into(),
        )
        .into()),
        Some((_, _, response)) => Ok(Some(serde_json::from_str(&response)?)),
    }
}

pub fn store<T: Serialize>(
    conn: &Connection,
    key: &str,
    operation: &str,
    fingerprint: &str,
    response: &T,
    now: DateTime<Utc>,
) -> Result<()> {
    validate_key(key)?;
    conn.execute(
        "INSERT INTO idempotency_keys (key, operation, fingerprint, response, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            key,
            operation,
            fingerprint,
            serde_json::to_string(response)?,
            to_ts(now)
        ],
    )?;
    Ok(())
}

/// Run `f` at most once per key and request.
///
/// Call inside the same transaction as the operation itself, so the stored
/// response commits or rolls back together with its side effects.
pub fn once<T, R, F>(
    conn: &Connection,
    key: Option<&str>,
    operation: &str,
    request: &R,
    now: DateTime<Utc>,
    f: F,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    R: Serialize + ?Sized,
    F: FnOnce() -> Result<T>,
{
    let Some(key) = key else {
        return f();
    };

    let fingerprint = fingerprint(operation, request)?;
    if let Some(previous) = lookup(conn, key, operation, &fingerprint)? {
        log::debug!("Replaying stored response for {} ({})", operation, key);
        return Ok(previous);
    }

    let response = f()?;
    store(conn, key, operation, &fingerprint, &response, now)?;
    Ok(response)
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(PolicyError::Invalid(format!(
            "idempotency key must be 1..={} bytes",
            MAX_KEY_LEN
        ))
        .into());
    }
    Ok(())
}
