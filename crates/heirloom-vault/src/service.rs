//! The vault API
//!
//! [`VaultService`] owns one connection and the components, and exposes the
//! client operations. Mutating operations take an optional idempotency key;
//! the stored response commits in the same transaction as the operation.

use crate::audit::{self, AuditEntry};
use crate::contacts::{self, TrustedContact};
use crate::coordinator::{UnlockCoordinator, UnlockOutcome, UnlockSweep};
use crate::db::{self, whole_seconds};
use crate::error::Result;
use crate::idempotency;
use crate::keyring::SharedKeyring;
use crate::ledger::{self, AccessGrant, IssuedToken, LegacyTokenLedger};
use crate::owners::{
    self, CheckInHistory, OwnerRecord, ProvisionReceipt, ProvisionRequest, UnlockStatus,
};
use crate::quorum::{self, TrustedContactQuorum, VerificationOutcome};
use crate::scheduler::{self, CheckInReceipt, CheckInScheduler, SweepReport};
use chrono::{DateTime, Utc};
use heirloom_core::{ContactId, HolderKeyRef, OwnerId};
use heirloom_inherit::{Assertion, CheckInSource, UnlockPolicy};
use heirloom_shamir::SHARE_COUNT;
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// One maintenance pass: check-in sweep, then due unlocks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub check_ins: SweepReport,
    pub unlocks: UnlockSweep,
}

pub struct VaultService {
    conn: Connection,
    keys: SharedKeyring,
    scheduler: CheckInScheduler,
    quorum: TrustedContactQuorum,
    ledger: LegacyTokenLedger,
    coordinator: UnlockCoordinator,
    default_policy: UnlockPolicy,
    clock: Clock,
}

impl VaultService {
    pub fn new(conn: Connection, keys: SharedKeyring) -> Self {
        Self {
            conn,
            coordinator: UnlockCoordinator::new(keys.clone()),
            keys,
            scheduler: CheckInScheduler::default(),
            quorum: TrustedContactQuorum::new(),
            ledger: LegacyTokenLedger::new(),
            default_policy: UnlockPolicy::default(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Open the database at `path` and build a service over it.
    pub fn open(path: &Path, busy_timeout: Duration, keys: SharedKeyring) -> Result<Self> {
        Ok(Self::new(db::open_db(path, busy_timeout)?, keys))
    }

    pub fn with_scheduler(mut self, scheduler: CheckInScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Policy for owners provisioned without one.
    pub fn with_default_policy(mut self, policy: UnlockPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Replace the wall clock, e.g. with a fixed time in tests.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn default_policy(&self) -> UnlockPolicy {
        self.default_policy
    }

    pub fn scheduler(&self) -> &CheckInScheduler {
        &self.scheduler
    }

    fn now(&self) -> DateTime<Utc> {
        whole_seconds((self.clock)())
    }

    // ------------------------------------------------------------------
    // Owners
    // ------------------------------------------------------------------

    pub fn provision_owner(
        &mut self,
        owner: &OwnerId,
        email: Option<&str>,
        policy: Option<UnlockPolicy>,
        holders: [HolderKeyRef; SHARE_COUNT],
    ) -> Result<ProvisionReceipt> {
        let now = self.now();
        let request = ProvisionRequest {
            owner_id: owner.clone(),
            email: email.map(str::to_string),
            policy: policy.unwrap_or(self.default_policy),
            holders,
        };
        owners::provision(&mut self.conn, self.keys.as_ref(), &request, now)
    }

    pub fn configure(&mut self, owner: &OwnerId, policy: UnlockPolicy) -> Result<OwnerRecord> {
        let now = self.now();
        owners::configure(&mut self.conn, owner, policy, now)
    }

    pub fn unlock_status(&self, owner: &OwnerId) -> Result<UnlockStatus> {
        owners::unlock_status(&self.conn, owner, self.now())
    }

    pub fn check_in_history(&self, owner: &OwnerId, page: u32, limit: u32) -> Result<CheckInHistory> {
        owners::check_in_history(&self.conn, owner, page, limit)
    }

    pub fn audit_log(&self, owner: &OwnerId) -> Result<Vec<AuditEntry>> {
        audit::entries(&self.conn, owner)
    }

    pub fn clear_remediation(&mut self, owner: &OwnerId, note: &str) -> Result<()> {
        let now = self.now();
        owners::clear_remediation(&mut self.conn, owner, note, now)
    }

    // ------------------------------------------------------------------
    // Check-ins
    // ------------------------------------------------------------------

    pub fn check_in(
        &mut self,
        owner: &OwnerId,
        source: CheckInSource,
        idempotency_key: Option<&str>,
    ) -> Result<CheckInReceipt> {
        let now = self.now();
        db::with_transaction(&mut self.conn, |tx| {
            idempotency::once(tx, idempotency_key, "check_in", &(owner, source), now, || {
                scheduler::record_check_in_tx(tx, owner, source, now)
            })
        })
    }

    // ------------------------------------------------------------------
    // Contacts & verification
    // ------------------------------------------------------------------

    pub fn enroll_contact(
        &mut self,
        owner: &OwnerId,
        contact: &ContactId,
        identity_ref: &str,
        email: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<TrustedContact> {
        let now = self.now();
        db::with_transaction(&mut self.conn, |tx| {
            let request = (owner, contact, identity_ref, email);
            idempotency::once(tx, idempotency_key, "enroll_contact", &request, now, || {
                contacts::enroll_contact_tx(tx, owner, contact, identity_ref, email, now)
            })
        })
    }

    pub fn confirm_contact(&mut self, contact: &ContactId) -> Result<TrustedContact> {
        let now = self.now();
        contacts::confirm_contact(&mut self.conn, contact, now)
    }

    pub fn list_contacts(&self, owner: &OwnerId) -> Result<Vec<TrustedContact>> {
        contacts::list_contacts(&self.conn, owner)
    }

    pub fn submit_verification(
        &mut self,
        contact: &ContactId,
        owner: &OwnerId,
        cycle_id: i64,
        assertion: Assertion,
        idempotency_key: Option<&str>,
    ) -> Result<VerificationOutcome> {
        let now = self.now();
        if idempotency_key.is_none() {
            return self
                .quorum
                .submit_verification(&mut self.conn, contact, owner, cycle_id, assertion, now);
        }
        db::with_transaction(&mut self.conn, |tx| {
            let request = (contact, owner, cycle_id, assertion);
            idempotency::once(tx, idempotency_key, "submit_verification", &request, now, || {
                quorum::submit_verification_tx(tx, contact, owner, cycle_id, assertion, now)
            })
        })
    }

    // ------------------------------------------------------------------
    // Legacy tokens
    // ------------------------------------------------------------------

    /// Issue a legacy token. A replay under the same idempotency key returns
    /// the receipt without the token itself.
    pub fn issue_token(
        &mut self,
        owner: &OwnerId,
        max_redemptions: u32,
        expires_at: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<IssuedToken> {
        let now = self.now();
        if idempotency_key.is_none() {
            return self
                .ledger
                .issue(&mut self.conn, owner, max_redemptions, expires_at, now);
        }
        let fingerprint = idempotency::fingerprint(
            "issue_token",
            &(owner, max_redemptions, db::to_ts(expires_at)),
        )?;
        db::with_transaction(&mut self.conn, |tx| {
            if let Some(key) = idempotency_key {
                if let Some(previous) =
                    idempotency::lookup::<IssuedToken>(tx, key, "issue_token", &fingerprint)?
                {
                    return Ok(previous);
                }
            }
            let issued = ledger::issue_tx(tx, owner, max_redemptions, expires_at, now)?;
            if let Some(key) = idempotency_key {
                idempotency::store(
                    tx,
                    key,
                    "issue_token",
                    &fingerprint,
                    &issued.without_secret(),
                    now,
                )?;
            }
            Ok(issued)
        })
    }

    pub fn redeem_token(
        &mut self,
        token: &str,
        idempotency_key: Option<&str>,
    ) -> Result<AccessGrant> {
        let now = self.now();
        if idempotency_key.is_none() {
            return self.ledger.redeem(&mut self.conn, token, now);
        }
        db::with_transaction(&mut self.conn, |tx| {
            idempotency::once(tx, idempotency_key, "redeem_token", token, now, || {
                ledger::redeem_tx(tx, token, now)
            })
        })
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    pub fn unlock(&mut self, owner: &OwnerId) -> Result<UnlockOutcome> {
        let now = self.now();
        self.coordinator.unlock(&mut self.conn, owner, now)
    }

    /// Unlock every owner whose grace period has run out.
    pub fn advance_pending_unlocks(&mut self) -> Result<UnlockSweep> {
        let now = self.now();
        self.coordinator.advance_pending_unlocks(&mut self.conn, now)
    }

    /// Check-in sweep over every owner, then any unlocks that fell due.
    pub fn run_maintenance(&mut self) -> Result<MaintenanceReport> {
        let now = self.now();
        let check_ins = self.scheduler.evaluate_due_check_ins(&mut self.conn, now)?;
        let unlocks = self.coordinator.advance_pending_unlocks(&mut self.conn, now)?;
        Ok(MaintenanceReport { check_ins, unlocks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;
    use crate::keyring::MemoryKeyring;
    use chrono::TimeZone;
    use heirloom_inherit::VaultState;
    use std::sync::Mutex;

    fn service() -> (VaultService, Arc<Mutex<DateTime<Utc>>>) {
        let ring = Arc::new(MemoryKeyring::new());
        for h in ["device", "a", "b"] {
            ring.generate(&HolderKeyRef::from(h));
        }
        let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let clock = now.clone();
        let svc = VaultService::new(db::open_in_memory().unwrap(), ring)
            .with_clock(move || *clock.lock().unwrap());
        (svc, now)
    }

    fn holders() -> [HolderKeyRef; 3] {
        [
            HolderKeyRef::from("device"),
            HolderKeyRef::from("a"),
            HolderKeyRef::from("b"),
        ]
    }

    #[test]
    fn test_check_in_replay() {
        let (mut svc, now) = service();
        let owner = OwnerId::from("frank");
        svc.provision_owner(&owner, None, None, holders()).unwrap();

        let first = svc.check_in(&owner, CheckInSource::Manual, Some("req-1")).unwrap();
        *now.lock().unwrap() += chrono::Duration::days(3);
        let replay = svc.check_in(&owner, CheckInSource::Manual, Some("req-1")).unwrap();
        assert_eq!(first, replay);
        assert_eq!(svc.check_in_history(&owner, 1, 10).unwrap().total, 1);

        // Same key, different operation
        let misuse = svc.redeem_token("abc", Some("req-1"));
        assert!(matches!(misuse, Err(VaultError::Policy(_))));
    }

    #[test]
    fn test_check_in_key_is_not_shared_between_owners() {
        let (mut svc, _now) = service();
        let alice = OwnerId::from("alice");
        let bob = OwnerId::from("bob");
        svc.provision_owner(&alice, None, None, holders()).unwrap();
        svc.provision_owner(&bob, None, None, holders()).unwrap();

        let receipt = svc.check_in(&alice, CheckInSource::Manual, Some("k")).unwrap();
        assert_eq!(receipt.owner_id, alice);

        let stolen = svc.check_in(&bob, CheckInSource::Manual, Some("k"));
        assert!(matches!(stolen, Err(VaultError::Policy(_))));
        assert_eq!(svc.check_in_history(&alice, 1, 10).unwrap().total, 1);
        assert_eq!(svc.check_in_history(&bob, 1, 10).unwrap().total, 0);

        // Bob retries under his own key
        let own = svc.check_in(&bob, CheckInSource::Manual, Some("k-bob")).unwrap();
        assert_eq!(own.owner_id, bob);
        assert_eq!(svc.check_in_history(&bob, 1, 10).unwrap().total, 1);
    }

    #[test]
    fn test_token_keys_are_bound_to_request() {
        let (mut svc, now) = service();
        let owner = OwnerId::from("frank");
        svc.provision_owner(&owner, None, None, holders()).unwrap();
        let expires = *now.lock().unwrap() + chrono::Duration::days(365);
        svc.issue_token(&owner, 3, expires, Some("issue-1")).unwrap();

        // Same key with different issue parameters
        let changed = svc.issue_token(&owner, 5, expires, Some("issue-1"));
        assert!(matches!(changed, Err(VaultError::Policy(_))));

        // Refusals are not stored, so the key stays free for another token
        let first = svc.redeem_token("token-one", Some("r"));
        assert!(matches!(first, Err(VaultError::AccessDenied(_))));
        let second = svc.redeem_token("token-two", Some("r"));
        assert!(matches!(second, Err(VaultError::AccessDenied(_))));
    }

    #[test]
    fn test_issue_replay_hides_token() {
        let (mut svc, now) = service();
        let owner = OwnerId::from("frank");
        svc.provision_owner(&owner, None, None, holders()).unwrap();
        let expires = *now.lock().unwrap() + chrono::Duration::days(365);

        let issued = svc.issue_token(&owner, 3, expires, Some("tok-1")).unwrap();
        assert!(!issued.token.is_empty());
        let replay = svc.issue_token(&owner, 3, expires, Some("tok-1")).unwrap();
        assert!(replay.token.is_empty());
        assert_eq!(replay.max_redemptions, 3);

        let count: i64 = svc
            .connection()
            .query_row("SELECT COUNT(*) FROM legacy_tokens", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let stored: String = svc
            .connection()
            .query_row("SELECT response FROM idempotency_keys", [], |row| row.get(0))
            .unwrap();
        assert!(!stored.contains(&issued.token));
    }

    #[test]
    fn test_default_policy_applies() {
        let (svc, _now) = service();
        let policy = UnlockPolicy::default().with_interval(30).unwrap();
        let mut svc = svc.with_default_policy(policy);
        let owner = OwnerId::from("gina");
        let receipt = svc.provision_owner(&owner, None, None, holders()).unwrap();
        let status = svc.unlock_status(&owner).unwrap();
        assert_eq!(status.state, VaultState::Alive);
        assert_eq!(status.next_check_in_at, receipt.next_check_in_at);
        assert_eq!(status.days_until_due, 30);
    }

    #[test]
    fn test_maintenance_on_empty_vault() {
        let (mut svc, _now) = service();
        let report = svc.run_maintenance().unwrap();
        assert_eq!(report.check_ins.visited, 0);
        assert!(report.unlocks.unlocked.is_empty());
    }
}
