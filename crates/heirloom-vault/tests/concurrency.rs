//! Concurrency properties against a file-backed database, one connection per
//! thread, the way sweep workers run in the daemon.

use chrono::{DateTime, Duration, TimeZone, Utc};
use heirloom_core::{ContactId, HolderKeyRef, OwnerId};
use heirloom_inherit::{Assertion, CheckInSource, UnlockPolicy, VaultState};
use heirloom_vault::contacts::{confirm_contact, enroll_contact};
use heirloom_vault::db::open_db;
use heirloom_vault::owners::{load_owner, load_state, provision};
use heirloom_vault::{
    audit, CheckInScheduler, DenyReason, LegacyTokenLedger, MemoryKeyring, ProvisionRequest,
    Shard, SharedKeyring, TrustedContactQuorum, UnlockCoordinator, UnlockOutcome,
};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

const BUSY: std::time::Duration = std::time::Duration::from_secs(10);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap()
}

fn day(n: i64) -> DateTime<Utc> {
    t0() + Duration::days(n)
}

fn keyring() -> SharedKeyring {
    let ring = MemoryKeyring::new();
    for h in ["device", "a", "b"] {
        ring.generate(&HolderKeyRef::from(h));
    }
    Arc::new(ring)
}

fn connect(path: &Path) -> Connection {
    open_db(path, BUSY).unwrap()
}

fn add_owner(conn: &mut Connection, keys: &SharedKeyring, name: &str, contacts: bool) -> OwnerId {
    let owner = OwnerId::from(name);
    provision(
        conn,
        keys.as_ref(),
        &ProvisionRequest {
            owner_id: owner.clone(),
            email: None,
            policy: UnlockPolicy::default(),
            holders: [
                HolderKeyRef::from("device"),
                HolderKeyRef::from("a"),
                HolderKeyRef::from("b"),
            ],
        },
        t0(),
    )
    .unwrap();
    if contacts {
        for c in ["a", "b"] {
            let contact = ContactId::from(format!("{}-{}", name, c));
            enroll_contact(conn, &owner, &contact, c, None, t0()).unwrap();
            confirm_contact(conn, &contact, t0()).unwrap();
        }
    }
    owner
}

/// Escalate and verify `owner`; returns its `unlock_at`.
fn make_pending(conn: &mut Connection, owner: &OwnerId) -> DateTime<Utc> {
    CheckInScheduler::default()
        .evaluate_due_check_ins(conn, day(271))
        .unwrap();
    let cycle = load_state(conn, owner).unwrap().cycle_id.unwrap();
    let quorum = TrustedContactQuorum::new();
    for c in ["a", "b"] {
        let contact = ContactId::from(format!("{}-{}", owner, c));
        quorum
            .submit_verification(conn, &contact, owner, cycle, Assertion::Deceased, day(272))
            .unwrap();
    }
    let state = load_state(conn, owner).unwrap();
    assert_eq!(state.state, VaultState::PendingUnlock);
    state.unlock_at.unwrap()
}

#[test]
fn test_token_redemption_is_linearizable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.db");
    let keys = keyring();

    let mut conn = connect(&path);
    let owner = add_owner(&mut conn, &keys, "owner", true);
    let token = LegacyTokenLedger::new()
        .issue(&mut conn, &owner, 5, day(1000), t0())
        .unwrap();
    let unlock_at = make_pending(&mut conn, &owner);
    UnlockCoordinator::new(keys.clone())
        .unlock(&mut conn, &owner, unlock_at)
        .unwrap();

    let callers = 6;
    let barrier = Arc::new(Barrier::new(callers));
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let mut conn = connect(&path);
                let barrier = barrier.clone();
                let token = token.token.clone();
                s.spawn(move || {
                    barrier.wait();
                    LegacyTokenLedger::new().redeem(&mut conn, &token, unlock_at + Duration::days(1))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let granted = results.iter().filter(|r| r.is_ok()).count();
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.deny_reason() == Some(DenyReason::Exhausted)))
        .count();
    assert_eq!(granted, 5);
    assert_eq!(exhausted, 1);

    let mut redemptions: Vec<u32> = results
        .into_iter()
        .filter_map(|r| r.ok())
        .map(|grant| grant.redemption)
        .collect();
    redemptions.sort_unstable();
    assert_eq!(redemptions, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_check_in_wins_race_with_sweep() {
    for round in 0..8 {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        let keys = keyring();
        let mut conn = connect(&path);
        let owner = add_owner(&mut conn, &keys, "racer", true);

        // Two intervals already missed; the next sweep would escalate
        CheckInScheduler::default()
            .evaluate_due_check_ins(&mut conn, day(181))
            .unwrap();
        let now = day(271);

        let barrier = Arc::new(Barrier::new(2));
        thread::scope(|s| {
            let mut sweep_conn = connect(&path);
            let mut check_in_conn = connect(&path);
            let b1 = barrier.clone();
            let b2 = barrier.clone();
            let sweeper = s.spawn(move || {
                b1.wait();
                CheckInScheduler::default().evaluate_due_check_ins(&mut sweep_conn, now)
            });
            let owner_ref = &owner;
            let checker = s.spawn(move || {
                b2.wait();
                CheckInScheduler::default().record_check_in(
                    &mut check_in_conn,
                    owner_ref,
                    CheckInSource::Manual,
                    now,
                )
            });
            let report = sweeper.join().unwrap().unwrap();
            assert!(report.failed.is_empty(), "round {}: {:?}", round, report.failed);
            checker.join().unwrap().unwrap();
        });

        let record = load_owner(&conn, &owner).unwrap();
        let state = load_state(&conn, &owner).unwrap();
        assert_eq!(record.missed_count, 0, "round {}", round);
        assert_eq!(state.state, VaultState::Alive, "round {}", round);
        assert_eq!(state.cycle_id, None, "round {}", round);
    }
}

#[test]
fn test_concurrent_unlockers_unlock_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.db");
    let keys = keyring();
    let mut conn = connect(&path);
    let owner = add_owner(&mut conn, &keys, "owner", true);
    let unlock_at = make_pending(&mut conn, &owner);

    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));
    let outcomes: Vec<UnlockOutcome> = thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let mut conn = connect(&path);
                let barrier = barrier.clone();
                let coordinator = UnlockCoordinator::new(keys.clone());
                let owner = owner.clone();
                s.spawn(move || {
                    barrier.wait();
                    coordinator.unlock(&mut conn, &owner, unlock_at).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let unlocked = outcomes
        .iter()
        .filter(|o| matches!(o, UnlockOutcome::Unlocked { .. }))
        .count();
    assert_eq!(unlocked, 1);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, UnlockOutcome::Unlocked { .. } | UnlockOutcome::AlreadyUnlocked)));

    let unlocked_entries = audit::entries(&conn, &owner)
        .unwrap()
        .into_iter()
        .filter(|e| e.action == "unlocked")
        .count();
    assert_eq!(unlocked_entries, 1);
}

#[test]
fn test_parallel_sweeps_escalate_each_owner_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.db");
    let keys = keyring();
    let mut conn = connect(&path);
    let owners: Vec<OwnerId> = (0..9)
        .map(|i| add_owner(&mut conn, &keys, &format!("owner-{}", i), false))
        .collect();

    // Overlapping workers: two full sweeps plus a sharded pair
    let shards = [Shard::ALL, Shard::ALL, Shard::new(0, 2).unwrap(), Shard::new(1, 2).unwrap()];
    let barrier = Arc::new(Barrier::new(shards.len()));
    let escalations: usize = thread::scope(|s| {
        let handles: Vec<_> = shards
            .iter()
            .map(|&shard| {
                let mut conn = connect(&path);
                let barrier = barrier.clone();
                s.spawn(move || {
                    barrier.wait();
                    let report = CheckInScheduler::default()
                        .evaluate_shard(&mut conn, day(271), shard)
                        .unwrap();
                    assert!(report.failed.is_empty(), "{:?}", report.failed);
                    report.escalations()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(escalations, owners.len());
    for owner in &owners {
        let state = load_state(&conn, owner).unwrap();
        assert_eq!(state.state, VaultState::Escalation);
        assert_eq!(state.version, 1);
        assert_eq!(state.cycle_id, Some(1));
    }
}
