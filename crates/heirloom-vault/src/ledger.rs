//! Legacy access tokens
//!
//! A token is a bearer secret handed to a recipient ahead of time. It grants
//! access to the owner's public items once the vault is unlocked, up to
//! `max_redemptions` times in total. Only its SHA-256 digest is stored.
//!
//! Redemption is one conditional `UPDATE ... RETURNING`: expiry, remaining
//! count and vault state are checked in the same statement that increments
//! the counter, so concurrent redeemers can never overshoot.

use crate::audit::{self, AuditRecord};
use crate::db::{self, to_ts, whole_seconds};
use crate::error::{DenyReason, Result, VaultError};
use crate::owners::load_owner;
use chrono::{DateTime, Utc};
use heirloom_core::OwnerId;
use heirloom_inherit::PolicyError;
use rand::RngCore;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Random bytes per token
pub const TOKEN_BYTES: usize = 32;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    /// Hex bearer token. Shown once; only its digest is kept. Empty when
    /// this is a replayed response.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    pub owner_id: OwnerId,
    pub expires_at: DateTime<Utc>,
    pub max_redemptions: u32,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"<redacted>")
            .field("owner_id", &self.owner_id)
            .field("expires_at", &self.expires_at)
            .field("max_redemptions", &self.max_redemptions)
            .finish()
    }
}

impl IssuedToken {
    /// The same receipt without the bearer secret.
    pub fn without_secret(&self) -> Self {
        Self {
            token: String::new(),
            ..self.clone()
        }
    }
}

/// What a grant lets the bearer see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessScope {
    PublicItems,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub owner_id: OwnerId,
    pub scope: AccessScope,
    /// 1-based number of this redemption
    pub redemption: u32,
    pub remaining: u32,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyTokenLedger;

impl LegacyTokenLedger {
    pub fn new() -> Self {
        Self
    }

    /// Create a token for `owner`. Never touches the vault state.
    pub fn issue(
        &self,
        conn: &mut Connection,
        owner: &OwnerId,
        max_redemptions: u32,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken> {
        db::with_transaction(conn, |tx| issue_tx(tx, owner, max_redemptions, expires_at, now))
    }

    /// Redeem `token`. Every refusal is the same opaque
    /// [`VaultError::AccessDenied`]; the reason is for logs and tests only.
    pub fn redeem(
        &self,
        conn: &mut Connection,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessGrant> {
        db::with_transaction(conn, |tx| redeem_tx(tx, token, now))
    }
}

pub fn issue_tx(
    conn: &Connection,
    owner: &OwnerId,
    max_redemptions: u32,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<IssuedToken> {
    let now = whole_seconds(now);
    let expires_at = whole_seconds(expires_at);
    load_owner(conn, owner)?;

    if max_redemptions == 0 {
        return Err(PolicyError::Invalid("max_redemptions must be at least 1".into()).into());
    }
    if expires_at <= now {
        return Err(PolicyError::Invalid(format!(
            "token expiry {} is not in the future",
            expires_at
        ))
        .into());
    }

    let mut bytes = zeroize::Zeroizing::new([0u8; TOKEN_BYTES]);
    rand::thread_rng().fill_bytes(&mut bytes[..]);
    let token = hex::encode(&bytes[..]);
    let digest = token_digest(&token);

    conn.execute(
        "INSERT INTO legacy_tokens (token_hash, owner_id, created_at, expires_at, max_redemptions)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            digest,
            owner.as_str(),
            to_ts(now),
            to_ts(expires_at),
            max_redemptions
        ],
    )?;
    audit::record(
        conn,
        owner,
        AuditRecord {
            action: "token_issued",
            detail: Some(format!(
                "{} (max {}, expires {})",
                short(&digest),
                max_redemptions,
                expires_at
            )),
            ..Default::default()
        },
        now,
    )?;

    log::info!("Issued legacy token {} for {}", short(&digest), owner);
    Ok(IssuedToken {
        token,
        owner_id: owner.clone(),
        expires_at,
        max_redemptions,
    })
}

pub fn redeem_tx(conn: &Connection, token: &str, now: DateTime<Utc>) -> Result<AccessGrant> {
    let now = whole_seconds(now);
    let digest = token_digest(token.trim());

    let granted = db::optional(conn.query_row(
        "UPDATE legacy_tokens SET redemption_count = redemption_count + 1
         WHERE token_hash = ?1
           AND expires_at > ?2
           AND redemption_count < max_redemptions
           AND EXISTS (
               SELECT 1 FROM vault_unlock_state s
               WHERE s.owner_id = legacy_tokens.owner_id AND s.state = 'unlocked'
           )
         RETURNING owner_id, redemption_count, max_redemptions",
        params![digest, to_ts(now)],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, u32>(2)?,
            ))
        },
    ))?;

    let Some((owner_id, redemption, max)) = granted else {
        let reason = deny_reason(conn, &digest, now)?;
        log::info!("Token {} refused: {:?}", short(&digest), reason);
        return Err(VaultError::AccessDenied(reason));
    };

    let owner_id = OwnerId::new(owner_id);
    audit::record(
        conn,
        &owner_id,
        AuditRecord {
            action: "token_redeemed",
            detail: Some(format!("{} ({}/{})", short(&digest), redemption, max)),
            ..Default::default()
        },
        now,
    )?;

    log::info!(
        "Token {} redeemed for {} ({}/{})",
        short(&digest),
        owner_id,
        redemption,
        max
    );
    Ok(AccessGrant {
        owner_id,
        scope: AccessScope::PublicItems,
        redemption,
        remaining: max - redemption,
        granted_at: now,
    })
}

/// Why a redemption that matched no row was refused.
fn deny_reason(conn: &Connection, digest: &str, now: DateTime<Utc>) -> Result<DenyReason> {
    let row = db::optional(conn.query_row(
        "SELECT t.expires_at, t.redemption_count, t.max_redemptions, s.state
         FROM legacy_tokens t
         LEFT JOIN vault_unlock_state s ON s.owner_id = t.owner_id
         WHERE t.token_hash = ?1",
        params![digest],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        },
    ))?;

    Ok(match row {
        None => DenyReason::NotFound,
        Some((expires_at, _, _, _)) if expires_at <= to_ts(now) => DenyReason::Expired,
        Some((_, count, max, _)) if count >= max => DenyReason::Exhausted,
        Some(_) => DenyReason::NotUnlocked,
    })
}

fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Digest prefix for logs
fn short(digest: &str) -> &str {
    &digest[..digest.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{apply_transition, Transition};
    use crate::db::open_in_memory;
    use crate::keyring::MemoryKeyring;
    use crate::owners::{load_state, provision, ProvisionRequest};
    use chrono::{Duration, TimeZone};
    use heirloom_core::HolderKeyRef;
    use heirloom_inherit::UnlockPolicy;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> (Connection, OwnerId) {
        let mut conn = open_in_memory().unwrap();
        let ring = MemoryKeyring::new();
        let holders = [
            HolderKeyRef::from("device"),
            HolderKeyRef::from("a"),
            HolderKeyRef::from("b"),
        ];
        for h in &holders {
            ring.generate(h);
        }
        let owner = OwnerId::from("erin");
        provision(
            &mut conn,
            &ring,
            &ProvisionRequest {
                owner_id: owner.clone(),
                email: None,
                policy: UnlockPolicy::default(),
                holders,
            },
            t0(),
        )
        .unwrap();
        (conn, owner)
    }

    fn force_unlocked(conn: &Connection, owner: &OwnerId) {
        let s = load_state(conn, owner).unwrap();
        let s = apply_transition(conn, owner, &s, &Transition::Escalate { cycle_id: 1 }, t0()).unwrap();
        let s = apply_transition(
            conn,
            owner,
            &s,
            &Transition::VerifyDeath {
                quorum_reached_at: t0(),
                unlock_at: t0(),
            },
            t0(),
        )
        .unwrap();
        apply_transition(
            conn,
            owner,
            &s,
            &Transition::Unlock {
                marker: "m".into(),
            },
            t0(),
        )
        .unwrap();
    }

    #[test]
    fn test_issue_validates() {
        let (mut conn, owner) = setup();
        let ledger = LegacyTokenLedger::new();
        let later = t0() + Duration::days(30);

        assert!(matches!(
            ledger.issue(&mut conn, &owner, 0, later, t0()),
            Err(VaultError::Policy(_))
        ));
        assert!(matches!(
            ledger.issue(&mut conn, &owner, 1, t0(), t0()),
            Err(VaultError::Policy(_))
        ));
        assert!(matches!(
            ledger.issue(&mut conn, &OwnerId::from("nobody"), 1, later, t0()),
            Err(VaultError::OwnerNotFound(_))
        ));

        let issued = ledger.issue(&mut conn, &owner, 2, later, t0()).unwrap();
        assert_eq!(issued.token.len(), TOKEN_BYTES * 2);
        assert!(!format!("{:?}", issued).contains(&issued.token));

        // Only the digest is stored
        let stored: String = conn
            .query_row("SELECT token_hash FROM legacy_tokens", [], |row| row.get(0))
            .unwrap();
        assert_ne!(stored, issued.token);
        assert_eq!(stored, token_digest(&issued.token));
    }

    #[test]
    fn test_redeem_requires_unlocked_vault() {
        let (mut conn, owner) = setup();
        let ledger = LegacyTokenLedger::new();
        let issued = ledger
            .issue(&mut conn, &owner, 1, t0() + Duration::days(30), t0())
            .unwrap();

        let denied = ledger.redeem(&mut conn, &issued.token, t0()).unwrap_err();
        assert_eq!(denied.deny_reason(), Some(DenyReason::NotUnlocked));
        assert_eq!(denied.to_string(), "cannot grant access");

        // A refused redemption does not use up the token
        force_unlocked(&conn, &owner);
        let grant = ledger.redeem(&mut conn, &issued.token, t0()).unwrap();
        assert_eq!(grant.scope, AccessScope::PublicItems);
        assert_eq!(grant.redemption, 1);
        assert_eq!(grant.remaining, 0);
    }

    #[test]
    fn test_exhausted_expired_and_unknown() {
        let (mut conn, owner) = setup();
        let ledger = LegacyTokenLedger::new();
        let expires = t0() + Duration::days(1);
        let issued = ledger.issue(&mut conn, &owner, 2, expires, t0()).unwrap();
        force_unlocked(&conn, &owner);

        ledger.redeem(&mut conn, &issued.token, t0()).unwrap();
        ledger.redeem(&mut conn, &issued.token, t0()).unwrap();
        let exhausted = ledger.redeem(&mut conn, &issued.token, t0()).unwrap_err();
        assert_eq!(exhausted.deny_reason(), Some(DenyReason::Exhausted));

        let other = ledger.issue(&mut conn, &owner, 5, expires, t0()).unwrap();
        let expired = ledger.redeem(&mut conn, &other.token, expires).unwrap_err();
        assert_eq!(expired.deny_reason(), Some(DenyReason::Expired));

        let unknown = ledger.redeem(&mut conn, "deadbeef", t0()).unwrap_err();
        assert_eq!(unknown.deny_reason(), Some(DenyReason::NotFound));

        // All refusals look the same from outside
        assert_eq!(exhausted.to_string(), unknown.to_string());
        assert_eq!(expired.to_string(), unknown.to_string());
    }
}
