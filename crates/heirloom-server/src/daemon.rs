//! The daemon loop: periodically sweeps check-ins, unlocks vaults whose grace
//! period ran out, and delivers queued notifications.

use crate::config::ServerConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use heirloom_notify::{DeliveryReport, NotificationService};
use heirloom_vault::db::open_db;
use heirloom_vault::{
    outbox, CheckInScheduler, OutboxMessage, Shard, SharedKeyring, SweepReport, UnlockSweep,
    VaultService,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// What one maintenance cycle did
#[derive(Debug, Default)]
pub struct CycleReport {
    pub check_ins: SweepReport,
    pub unlocks: UnlockSweep,
    pub delivery: DeliveryReport,
}

pub struct Daemon {
    db_path: PathBuf,
    busy_timeout: Duration,
    workers: u32,
    batch_size: usize,
    interval: Duration,
    scheduler: CheckInScheduler,
    service: Arc<Mutex<VaultService>>,
    notifier: NotificationService,
    clock: Clock,
}

impl Daemon {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(Utc::now))
    }

    /// Build the daemon with an explicit time source.
    ///
    /// Creates the data directory and runs schema migrations.
    pub fn with_clock(config: &ServerConfig, clock: Clock) -> Result<Self> {
        std::fs::create_dir_all(&config.server.data_dir).with_context(|| {
            format!(
                "Failed to create data dir: {}",
                config.server.data_dir.display()
            )
        })?;

        let keys: SharedKeyring = Arc::new(config.build_keyring()?);
        let scheduler = CheckInScheduler::new(config.notifications.lead_days.clone());

        let db_path = config.db_path();
        let service_clock = clock.clone();
        let service = VaultService::open(&db_path, config.busy_timeout(), keys)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?
            .with_scheduler(scheduler.clone())
            .with_default_policy(config.policy)
            .with_clock(move || service_clock());

        let notifier = NotificationService::new(config.notifications.clone());
        notifier
            .validate()
            .context("Invalid notification settings")?;

        Ok(Self {
            db_path,
            busy_timeout: config.busy_timeout(),
            workers: config.server.workers.max(1),
            batch_size: config.notifications.batch_size,
            interval: Duration::from_secs(config.server.sweep_interval_secs),
            scheduler,
            service: Arc::new(Mutex::new(service)),
            notifier,
            clock,
        })
    }

    /// The vault API on the daemon's own connection.
    #[cfg(test)]
    pub fn service(&self) -> Arc<Mutex<VaultService>> {
        self.service.clone()
    }

    /// Run the daemon loop. Blocks forever (until shutdown signal).
    pub async fn run(self) -> Result<()> {
        log::info!("Heirloom server starting…");
        log::info!("  Database:   {}", self.db_path.display());
        log::info!(
            "  Interval:   {} seconds ({:.1} minutes)",
            self.interval.as_secs(),
            self.interval.as_secs() as f64 / 60.0
        );
        log::info!("  Workers:    {}", self.workers);
        log::info!("  Lead days:  {:?}", self.scheduler.lead_days());
        log::info!(
            "  Delivery:   {}",
            if self.notifier.is_log_only() {
                "log only"
            } else {
                "email"
            }
        );

        // Run first cycle immediately, then loop
        let mut first = true;
        loop {
            if !first {
                log::debug!(
                    "Sleeping {} seconds until next cycle…",
                    self.interval.as_secs()
                );
                tokio::time::sleep(self.interval).await;
            }
            first = false;

            if let Err(e) = self.run_cycle().await {
                log::error!("Maintenance cycle failed: {:#}", e);
            }
        }
    }

    /// One maintenance cycle: sharded check-in sweep, pending unlocks, outbox drain.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let now = (self.clock)();
        log::info!("Starting maintenance cycle at {}…", now);

        let check_ins = self.sweep_check_ins(now).await?;
        let unlocks = self.advance_unlocks().await?;
        let delivery = self.drain_outbox().await?;

        log::info!(
            "Cycle completed: {} owners visited, {} escalated, {} unlocked, {} delivered, {} failed deliveries",
            check_ins.visited,
            check_ins.escalations(),
            unlocks.unlocked.len(),
            delivery.delivered.len(),
            delivery.failed.len()
        );
        if !check_ins.failed.is_empty() || !unlocks.failed.is_empty() {
            log::warn!(
                "{} check-in evaluations and {} unlocks failed this cycle",
                check_ins.failed.len(),
                unlocks.failed.len()
            );
        }

        Ok(CycleReport {
            check_ins,
            unlocks,
            delivery,
        })
    }

    /// Evaluate every owner across `workers` blocking tasks, one connection each.
    async fn sweep_check_ins(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut handles = Vec::with_capacity(self.workers as usize);
        for index in 0..self.workers {
            let shard = Shard::new(index, self.workers).context("invalid sweep shard")?;
            let path = self.db_path.clone();
            let busy_timeout = self.busy_timeout;
            let scheduler = self.scheduler.clone();

            handles.push(tokio::task::spawn_blocking(move || -> Result<SweepReport> {
                let mut conn = open_db(&path, busy_timeout)
                    .with_context(|| format!("Failed to open database: {}", path.display()))?;
                Ok(scheduler.evaluate_shard(&mut conn, now, shard)?)
            }));
        }

        let mut report = SweepReport::default();
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.await.context("Sweep worker panicked")? {
                Ok(part) => report.merge(part),
                Err(e) => log::error!("Sweep worker {} failed: {:#}", index, e),
            }
        }
        Ok(report)
    }

    async fn advance_unlocks(&self) -> Result<UnlockSweep> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || -> Result<UnlockSweep> {
            Ok(lock(&service)?.advance_pending_unlocks()?)
        })
        .await
        .context("Unlock task panicked")?
    }

    /// Deliver up to one batch of queued notifications.
    ///
    /// Delivery results are written back to the outbox; they never touch
    /// vault state.
    async fn drain_outbox(&self) -> Result<DeliveryReport> {
        let service = self.service.clone();
        let limit = self.batch_size;
        let pending = tokio::task::spawn_blocking(move || -> Result<Vec<OutboxMessage>> {
            let service = lock(&service)?;
            Ok(outbox::pending(service.connection(), limit)?)
        })
        .await
        .context("Outbox read panicked")??;

        if pending.is_empty() {
            return Ok(DeliveryReport::default());
        }

        let report = self.notifier.deliver_batch(&pending).await;

        let service = self.service.clone();
        let results = report.clone();
        let now = (self.clock)();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let service = lock(&service)?;
            for id in &results.delivered {
                outbox::mark_delivered(service.connection(), *id, now)?;
            }
            for (id, error) in &results.failed {
                outbox::mark_failed(service.connection(), *id, error)?;
            }
            Ok(())
        })
        .await
        .context("Outbox update panicked")??;

        Ok(report)
    }
}

fn lock(service: &Mutex<VaultService>) -> Result<MutexGuard<'_, VaultService>> {
    service
        .lock()
        .map_err(|_| anyhow::anyhow!("vault service lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use heirloom_core::{ContactId, HolderKeyRef, OwnerId};
    use heirloom_inherit::{Assertion, VaultState};
    use heirloom_vault::owners::load_state;
    use heirloom_vault::FileKeyring;

    struct Harness {
        _dir: tempfile::TempDir,
        daemon: Daemon,
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn harness(workers: u32) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::default();
        config.server.data_dir = dir.path().join("data");
        config.server.workers = workers;
        config.keyring.keys_dir = dir.path().join("keys");

        let ring = FileKeyring::new(&config.keyring.keys_dir);
        for holder in ["device", "a", "b"] {
            ring.generate(&HolderKeyRef::from(holder)).unwrap();
        }

        let now = Arc::new(Mutex::new(t0()));
        let clock = now.clone();
        let daemon =
            Daemon::with_clock(&config, Arc::new(move || *clock.lock().unwrap())).unwrap();
        Harness {
            _dir: dir,
            daemon,
            now,
        }
    }

    fn provision(h: &Harness, name: &str) -> OwnerId {
        let owner = OwnerId::from(name);
        let service = h.daemon.service();
        let mut svc = service.lock().unwrap();
        svc.provision_owner(
            &owner,
            Some("owner@example.com"),
            None,
            [
                HolderKeyRef::from("device"),
                HolderKeyRef::from("a"),
                HolderKeyRef::from("b"),
            ],
        )
        .unwrap();
        for c in ["a", "b"] {
            let contact = ContactId::from(format!("{}-{}", name, c));
            svc.enroll_contact(&owner, &contact, c, Some("contact@example.com"), None)
                .unwrap();
            svc.confirm_contact(&contact).unwrap();
        }
        owner
    }

    fn advance(h: &Harness, days: i64) {
        *h.now.lock().unwrap() = t0() + chrono::Duration::days(days);
    }

    #[tokio::test]
    async fn test_empty_cycle() {
        let h = harness(2);
        let report = h.daemon.run_cycle().await.unwrap();
        assert_eq!(report.check_ins.visited, 0);
        assert!(report.unlocks.unlocked.is_empty());
        assert!(report.delivery.delivered.is_empty());
        assert!(h.daemon.db_path.exists());
    }

    #[tokio::test]
    async fn test_cycle_escalates_once_across_workers() {
        let h = harness(3);
        let owners: Vec<OwnerId> = (0..5).map(|i| provision(&h, &format!("o{}", i))).collect();

        advance(&h, 271);
        let report = h.daemon.run_cycle().await.unwrap();
        assert_eq!(report.check_ins.escalations(), owners.len());
        assert!(report.check_ins.failed.is_empty());
        assert!(report.delivery.failed.is_empty());
        assert!(!report.delivery.delivered.is_empty());

        let again = h.daemon.run_cycle().await.unwrap();
        assert_eq!(again.check_ins.escalations(), 0);

        let service = h.daemon.service();
        let svc = service.lock().unwrap();
        for owner in &owners {
            let state = load_state(svc.connection(), owner).unwrap();
            assert_eq!(state.state, VaultState::Escalation);
            assert_eq!(state.version, 1);
        }
    }

    #[tokio::test]
    async fn test_cycle_unlocks_after_grace() {
        let h = harness(1);
        let owner = provision(&h, "grace");

        advance(&h, 271);
        h.daemon.run_cycle().await.unwrap();

        advance(&h, 272);
        {
            let service = h.daemon.service();
            let mut svc = service.lock().unwrap();
            let cycle = svc.unlock_status(&owner).unwrap().cycle_id.unwrap();
            for c in ["a", "b"] {
                let contact = ContactId::from(format!("grace-{}", c));
                svc.submit_verification(&contact, &owner, cycle, Assertion::Deceased, None)
                    .unwrap();
            }
        }

        // Grace period (14 days) still running
        advance(&h, 280);
        let report = h.daemon.run_cycle().await.unwrap();
        assert!(report.unlocks.unlocked.is_empty());

        advance(&h, 287);
        let report = h.daemon.run_cycle().await.unwrap();
        assert_eq!(report.unlocks.unlocked, vec![owner.clone()]);
        assert!(report.delivery.failed.is_empty());

        let service = h.daemon.service();
        let svc = service.lock().unwrap();
        assert!(outbox::pending(svc.connection(), 100).unwrap().is_empty());
        assert_eq!(
            svc.unlock_status(&owner).unwrap().state,
            VaultState::Unlocked
        );
    }
}
