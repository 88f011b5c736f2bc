// Expiration daemon

//! Long-running expiration enforcement
//!
//! On startup every overdue record is deactivated before anything else runs,
//! then the remaining future records become scheduler jobs. The event loop
//! waits for the earliest job, a periodic ledger resync or shutdown.
//!
//! Other processes (the CLI) only write the ledger. The resync tick brings the
//! job set in line with it, and every fired job re-reads its record first, so a
//! grant that was cleared or extended in the meantime never deactivates a peer.

use crate::ledger::Expiry;
use crate::lifecycle::{ExpireOutcome, PeerLifecycle};
use crate::notify::{Notification, OperatorNotifier};
use crate::provision::Provision;
use crate::reload::Reload;
use crate::scheduler::{ExpirationScheduler, Reconciled, ScheduledJob};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Longest sleep between checks when no job is due sooner
const MAX_WAIT_SECS: u64 = 3600;

/// Owns the scheduler and drives deactivations through the lifecycle
pub struct Daemon<R, P> {
    lifecycle: PeerLifecycle<R, P>,
    scheduler: ExpirationScheduler,
    notifier: OperatorNotifier,
    resync_interval: Duration,
}

impl<R: Reload, P: Provision> Daemon<R, P> {
    /// Daemon with an empty job set; [`Daemon::startup`] fills it
    pub fn new(
        lifecycle: PeerLifecycle<R, P>,
        notifier: OperatorNotifier,
        resync_interval: Duration,
    ) -> Self {
        Self {
            lifecycle,
            scheduler: ExpirationScheduler::new(),
            notifier,
            resync_interval,
        }
    }

    /// Lifecycle used for deactivations
    pub fn lifecycle(&self) -> &PeerLifecycle<R, P> {
        &self.lifecycle
    }

    /// Pending expiration jobs
    pub fn scheduler(&self) -> &ExpirationScheduler {
        &self.scheduler
    }

    /// Rebuild the job set from the ledger and deactivate overdue peers
    ///
    /// Returns the number of overdue records handled.
    pub async fn startup(&mut self, now: DateTime<Utc>) -> usize {
        let (scheduler, overdue) =
            ExpirationScheduler::restore(self.lifecycle.ledger().list_all(), now);
        self.scheduler = scheduler;

        log::info!(
            "Restored {} expiration job(s), {} overdue",
            self.scheduler.len(),
            overdue.len()
        );

        let count = overdue.len();
        for job in overdue {
            self.fire(job, now).await;
        }
        count
    }

    /// Fire every job due at `now`; returns how many were due
    pub async fn run_due(&mut self, now: DateTime<Utc>) -> usize {
        let due = self.scheduler.pop_due(now);
        let count = due.len();
        for job in due {
            self.fire(job, now).await;
        }
        count
    }

    /// Reconcile the job set with the ledger
    pub fn resync(&mut self, now: DateTime<Utc>) -> Reconciled {
        let result = self
            .scheduler
            .reconcile(self.lifecycle.ledger().list_all(), now);
        if !result.is_empty() {
            log::info!(
                "Ledger resync: scheduled {:?}, cancelled {:?}",
                result.scheduled,
                result.cancelled
            );
        }
        result
    }

    /// Deactivate the peer of a due job if its record still says so
    async fn fire(&mut self, job: ScheduledJob, now: DateTime<Utc>) {
        let username = job.username;

        match self.lifecycle.get_expiration(&username) {
            Some(Expiry::At(at)) if at <= now => {}
            Some(Expiry::At(at)) => {
                log::info!("Expiry of {} moved to {}, rescheduling", username, at);
                self.scheduler.schedule(&username, at);
                return;
            }
            Some(Expiry::Never) | None => {
                log::info!("Expiry of {} was cleared, skipping", username);
                return;
            }
        }

        log::info!("Access of {} expired at {}", username, job.fire_at);
        match self.lifecycle.expire(&username).await {
            Ok(ExpireOutcome::Deactivated) => {
                self.notifier
                    .notify(&Notification::Deactivated(username))
                    .await;
            }
            Ok(ExpireOutcome::AlreadyRemoved) => {
                log::info!("Peer {} was already removed", username);
            }
            Err(e) => {
                let reason = e.to_string();
                self.notifier
                    .notify(&Notification::DeactivationFailed { username, reason })
                    .await;
            }
        }
    }

    /// Time to sleep before the earliest job is due
    fn next_wait(&mut self, now: DateTime<Utc>) -> Duration {
        let max = Duration::from_secs(MAX_WAIT_SECS);
        match self.scheduler.next_due() {
            Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO).min(max),
            None => max,
        }
    }

    /// Run until `shutdown` completes
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        self.startup(Utc::now()).await;

        tokio::pin!(shutdown);
        let mut resync_timer = tokio::time::interval(self.resync_interval);
        resync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!("Expiration daemon started");

        loop {
            let wait = self.next_wait(Utc::now());

            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }

                _ = tokio::time::sleep(wait) => {
                    self.run_due(Utc::now()).await;
                }

                _ = resync_timer.tick() => {
                    self.resync(Utc::now());
                }
            }
        }

        log::info!("Expiration daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::fakes::{lifecycle, FakeProvisioner, FakeReloader};
    use crate::peer_store::PeerState;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn daemon(dir: &std::path::Path) -> Daemon<FakeReloader, FakeProvisioner> {
        Daemon::new(
            lifecycle(dir),
            OperatorNotifier::new(None, Duration::from_secs(5)),
            Duration::from_secs(30),
        )
    }

    fn future_records(daemon: &Daemon<FakeReloader, FakeProvisioner>, now: DateTime<Utc>) -> usize {
        daemon
            .lifecycle()
            .ledger()
            .list_all()
            .into_iter()
            .filter(|(_, e)| matches!(e, Expiry::At(t) if *t > now))
            .count()
    }

    #[tokio::test]
    async fn test_startup_catches_up_overdue() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = daemon(dir.path());
        let now = at(2025, 1, 1);
        let ledger = daemon.lifecycle().ledger().clone();
        ledger.set("bob", Some(at(2024, 12, 1))).unwrap();
        ledger.set("alice", Some(at(2030, 1, 1))).unwrap();
        ledger.set("ghost", Some(at(2024, 1, 1))).unwrap();

        assert_eq!(daemon.startup(now).await, 2);

        assert_eq!(
            daemon.lifecycle().status("bob").unwrap(),
            Some(PeerState::Disabled)
        );
        assert_eq!(ledger.get("bob"), None);
        assert_eq!(ledger.get("ghost"), None);
        assert_eq!(
            daemon.scheduler().jobs(),
            vec![ScheduledJob {
                username: "alice".to_string(),
                fire_at: at(2030, 1, 1)
            }]
        );
        assert_eq!(daemon.scheduler().len(), future_records(&daemon, now));
    }

    #[tokio::test]
    async fn test_due_job_deactivates() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = daemon(dir.path());
        daemon
            .lifecycle()
            .ledger()
            .set("alice", Some(at(2030, 1, 1)))
            .unwrap();
        daemon.startup(at(2025, 1, 1)).await;

        assert_eq!(daemon.run_due(at(2029, 12, 31)).await, 0);
        assert_eq!(daemon.run_due(at(2030, 1, 1)).await, 1);
        assert!(daemon.lifecycle().store().is_blocked("alice").unwrap());
        assert_eq!(daemon.lifecycle().get_expiration("alice"), None);
        assert!(daemon.scheduler().is_empty());
    }

    #[tokio::test]
    async fn test_cleared_record_does_not_fire() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = daemon(dir.path());
        let ledger = daemon.lifecycle().ledger().clone();
        ledger.set("alice", Some(at(2030, 1, 1))).unwrap();
        daemon.startup(at(2025, 1, 1)).await;

        // Cleared by another process before the resync noticed
        ledger.set("alice", None).unwrap();
        daemon.run_due(at(2030, 1, 2)).await;

        assert_eq!(
            daemon.lifecycle().status("alice").unwrap(),
            Some(PeerState::Enabled)
        );
        assert_eq!(ledger.get("alice"), Some(Expiry::Never));
        assert!(daemon.scheduler().is_empty());
    }

    #[tokio::test]
    async fn test_extended_record_is_rescheduled() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = daemon(dir.path());
        let ledger = daemon.lifecycle().ledger().clone();
        ledger.set("alice", Some(at(2030, 1, 1))).unwrap();
        daemon.startup(at(2025, 1, 1)).await;

        ledger.set("alice", Some(at(2032, 1, 1))).unwrap();
        daemon.run_due(at(2031, 1, 1)).await;

        assert!(!daemon.lifecycle().store().is_blocked("alice").unwrap());
        assert_eq!(daemon.scheduler().get("alice"), Some(at(2032, 1, 1)));
    }

    #[tokio::test]
    async fn test_resync_follows_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = daemon(dir.path());
        let now = at(2025, 1, 1);
        daemon.startup(now).await;
        assert!(daemon.scheduler().is_empty());

        daemon
            .lifecycle()
            .set_expiration("bob", at(2030, 1, 1), now)
            .await
            .unwrap();
        assert_eq!(daemon.resync(now).scheduled, vec!["bob"]);
        assert_eq!(daemon.scheduler().len(), future_records(&daemon, now));

        daemon.lifecycle().clear_expiration("bob").await.unwrap();
        assert_eq!(daemon.resync(now).cancelled, vec!["bob"]);
        assert!(daemon.scheduler().is_empty());
        assert_eq!(future_records(&daemon, now), 0);
    }

    #[tokio::test]
    async fn test_failed_deactivation_keeps_peer_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = daemon(dir.path());
        daemon
            .lifecycle()
            .ledger()
            .set("bob", Some(at(2024, 1, 1)))
            .unwrap();
        daemon.lifecycle().reloader().set_fail(true);

        daemon.startup(at(2025, 1, 1)).await;

        assert_eq!(
            daemon.lifecycle().status("bob").unwrap(),
            Some(PeerState::Enabled)
        );
        // Not retried by the loop
        assert!(daemon.scheduler().is_empty());
        assert_eq!(daemon.resync(at(2025, 1, 1)), Reconciled::default());
    }

    #[tokio::test]
    async fn test_run_fires_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon(dir.path());
        let ledger = daemon.lifecycle().ledger().clone();
        let store = daemon.lifecycle().store().clone();
        ledger
            .set(
                "bob",
                Some(Utc::now() + chrono::TimeDelta::milliseconds(200)),
            )
            .unwrap();

        daemon
            .run(tokio::time::sleep(Duration::from_secs(2)))
            .await;

        assert!(store.is_blocked("bob").unwrap());
        assert_eq!(ledger.get("bob"), None);
    }
}
