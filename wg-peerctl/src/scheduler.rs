// Expiration scheduler

//! In-memory expiration timers
//!
//! One min-heap keyed by fire instant holds every pending job. A job is live
//! only while the `live` map still points at its sequence number, so
//! rescheduling or cancelling a user just updates the map and the stale heap
//! entry is discarded when it reaches the top.
//!
//! The scheduler never acts on its own; the daemon asks it for the next due
//! instant and for the jobs that are due, then runs the deactivation itself.

use crate::ledger::Expiry;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// A pending deactivation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    /// Peer to deactivate
    pub username: String,
    /// When access ends
    pub fire_at: DateTime<Utc>,
}

/// Changes made by [`ExpirationScheduler::reconcile`]
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Users that got a new or moved job
    pub scheduled: Vec<String>,
    /// Users whose job was dropped
    pub cancelled: Vec<String>,
}

impl Reconciled {
    /// Nothing was scheduled or cancelled
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty() && self.cancelled.is_empty()
    }
}

/// Priority queue of expiration jobs, at most one per user
#[derive(Debug, Default)]
pub struct ExpirationScheduler {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, String)>>,
    live: HashMap<String, (DateTime<Utc>, u64)>,
    next_seq: u64,
}

impl ExpirationScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the job set from ledger records at startup
    ///
    /// Records in the future are scheduled. Records already due are returned
    /// so the caller can deactivate them before doing anything else.
    pub fn restore<I>(records: I, now: DateTime<Utc>) -> (Self, Vec<ScheduledJob>)
    where
        I: IntoIterator<Item = (String, Expiry)>,
    {
        let mut scheduler = Self::new();
        let mut overdue = Vec::new();

        for (username, expiry) in records {
            let Expiry::At(fire_at) = expiry else {
                continue;
            };
            if fire_at > now {
                scheduler.schedule(&username, fire_at);
            } else {
                overdue.push(ScheduledJob { username, fire_at });
            }
        }

        overdue.sort_by(|a, b| (a.fire_at, &a.username).cmp(&(b.fire_at, &b.username)));
        (scheduler, overdue)
    }

    /// Schedule `username` at `fire_at`, replacing any existing job
    ///
    /// Returns the instant of the replaced job, if there was one.
    pub fn schedule(&mut self, username: &str, fire_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(Reverse((fire_at, seq, username.to_string())));
        let previous = self
            .live
            .insert(username.to_string(), (fire_at, seq))
            .map(|(at, _)| at);

        log::debug!("Scheduled expiry of {} at {}", username, fire_at);
        previous
    }

    /// Drop the job for `username`; returns false if there was none
    pub fn cancel(&mut self, username: &str) -> bool {
        let cancelled = self.live.remove(username).is_some();
        if cancelled {
            log::debug!("Cancelled expiry of {}", username);
        }
        cancelled
    }

    /// Discard heap entries that no longer match a live job
    fn prune(&mut self) {
        while let Some(Reverse((_, seq, username))) = self.heap.peek() {
            let is_live =
                matches!(self.live.get(username), Some(&(_, live_seq)) if live_seq == *seq);
            if is_live {
                break;
            }
            self.heap.pop();
        }
    }

    /// Instant of the earliest live job
    pub fn next_due(&mut self) -> Option<DateTime<Utc>> {
        self.prune();
        self.heap.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Remove and return every job due at or before `now`, earliest first
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<ScheduledJob> {
        let mut due = Vec::new();

        loop {
            self.prune();
            match self.heap.peek() {
                Some(Reverse((at, _, _))) if *at <= now => {}
                _ => break,
            }
            if let Some(Reverse((fire_at, _, username))) = self.heap.pop() {
                self.live.remove(&username);
                due.push(ScheduledJob { username, fire_at });
            }
        }

        due
    }

    /// Fire instant of the job for `username`
    pub fn get(&self, username: &str) -> Option<DateTime<Utc>> {
        self.live.get(username).map(|&(at, _)| at)
    }

    /// All live jobs ordered by fire instant
    pub fn jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<_> = self
            .live
            .iter()
            .map(|(username, &(fire_at, _))| ScheduledJob {
                username: username.clone(),
                fire_at,
            })
            .collect();
        jobs.sort_by(|a, b| (a.fire_at, &a.username).cmp(&(b.fire_at, &b.username)));
        jobs
    }

    /// Number of live jobs
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// No live jobs
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Bring the job set in line with the current ledger records
    ///
    /// Future records get a job at their instant. Jobs whose record was
    /// removed, cleared or moved into the past are cancelled, except jobs
    /// still matching their record exactly, which are left to fire.
    pub fn reconcile<I>(&mut self, records: I, now: DateTime<Utc>) -> Reconciled
    where
        I: IntoIterator<Item = (String, Expiry)>,
    {
        let records: HashMap<String, Expiry> = records.into_iter().collect();
        let mut result = Reconciled::default();

        let stale: Vec<String> = self
            .live
            .iter()
            .filter(|&(username, &(at, _))| match records.get(username) {
                Some(Expiry::At(record_at)) => *record_at != at && *record_at <= now,
                _ => true,
            })
            .map(|(username, _)| username.clone())
            .collect();
        for username in stale {
            self.cancel(&username);
            result.cancelled.push(username);
        }

        for (username, expiry) in &records {
            let Expiry::At(at) = *expiry else {
                continue;
            };
            if at <= now || self.get(username) == Some(at) {
                continue;
            }
            self.schedule(username, at);
            result.scheduled.push(username.clone());
        }

        result.scheduled.sort();
        result.cancelled.sort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn future_record_count(records: &[(String, Expiry)], now: DateTime<Utc>) -> usize {
        records
            .iter()
            .filter(|(_, e)| matches!(e, Expiry::At(t) if *t > now))
            .count()
    }

    #[test]
    fn test_restore_schedules_future_record() {
        let records = vec![("bob".to_string(), Expiry::At(at(2030, 1, 1)))];
        let (mut scheduler, overdue) = ExpirationScheduler::restore(records, at(2025, 1, 1));

        assert!(overdue.is_empty());
        assert_eq!(
            scheduler.jobs(),
            vec![ScheduledJob {
                username: "bob".to_string(),
                fire_at: at(2030, 1, 1)
            }]
        );

        assert!(scheduler.cancel("bob"));
        assert!(scheduler.jobs().is_empty());
        assert_eq!(scheduler.next_due(), None);
    }

    #[test]
    fn test_restore_splits_overdue_and_never() {
        let now = at(2025, 1, 1);
        let records = vec![
            ("old".to_string(), Expiry::At(at(2024, 6, 1))),
            ("older".to_string(), Expiry::At(at(2024, 1, 1))),
            ("unlimited".to_string(), Expiry::Never),
            ("later".to_string(), Expiry::At(at(2026, 1, 1))),
            ("exact".to_string(), Expiry::At(now)),
        ];
        let (scheduler, overdue) = ExpirationScheduler::restore(records.clone(), now);

        let names: Vec<_> = overdue.iter().map(|j| j.username.as_str()).collect();
        assert_eq!(names, vec!["older", "old", "exact"]);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.len(), future_record_count(&records, now));
        assert_eq!(scheduler.get("later"), Some(at(2026, 1, 1)));
    }

    #[test]
    fn test_schedule_replaces_existing() {
        let mut scheduler = ExpirationScheduler::new();
        assert_eq!(scheduler.schedule("alice", at(2030, 1, 1)), None);
        assert_eq!(
            scheduler.schedule("alice", at(2031, 1, 1)),
            Some(at(2030, 1, 1))
        );
        assert_eq!(scheduler.len(), 1);

        // The replaced entry must not fire
        assert!(scheduler.pop_due(at(2030, 6, 1)).is_empty());
        assert_eq!(scheduler.next_due(), Some(at(2031, 1, 1)));
    }

    #[test]
    fn test_cancel_missing_is_noop() {
        let mut scheduler = ExpirationScheduler::new();
        assert!(!scheduler.cancel("nobody"));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_pop_due_in_order() {
        let mut scheduler = ExpirationScheduler::new();
        scheduler.schedule("c", at(2030, 3, 1));
        scheduler.schedule("a", at(2030, 1, 1));
        scheduler.schedule("b", at(2030, 2, 1));

        let due = scheduler.pop_due(at(2030, 2, 1));
        let names: Vec<_> = due.iter().map(|j| j.username.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.next_due(), Some(at(2030, 3, 1)));

        // Fired jobs are gone
        assert!(scheduler.pop_due(at(2030, 2, 15)).is_empty());
    }

    #[test]
    fn test_cancel_then_reschedule_fires_once() {
        let mut scheduler = ExpirationScheduler::new();
        scheduler.schedule("alice", at(2030, 1, 1));
        scheduler.cancel("alice");
        scheduler.schedule("alice", at(2030, 1, 1));

        let due = scheduler.pop_due(at(2031, 1, 1));
        assert_eq!(due.len(), 1);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_reconcile_tracks_ledger() {
        let now = at(2025, 1, 1);
        let mut scheduler = ExpirationScheduler::new();
        scheduler.schedule("removed", at(2026, 1, 1));
        scheduler.schedule("cleared", at(2026, 1, 1));
        scheduler.schedule("moved", at(2026, 1, 1));
        scheduler.schedule("same", at(2026, 1, 1));

        let records = vec![
            ("cleared".to_string(), Expiry::Never),
            ("moved".to_string(), Expiry::At(at(2027, 1, 1))),
            ("same".to_string(), Expiry::At(at(2026, 1, 1))),
            ("new".to_string(), Expiry::At(at(2028, 1, 1))),
            ("past".to_string(), Expiry::At(at(2024, 1, 1))),
        ];
        let result = scheduler.reconcile(records.clone(), now);

        assert_eq!(result.scheduled, vec!["moved", "new"]);
        assert_eq!(result.cancelled, vec!["cleared", "removed"]);
        assert_eq!(scheduler.get("moved"), Some(at(2027, 1, 1)));
        assert_eq!(scheduler.get("same"), Some(at(2026, 1, 1)));
        assert_eq!(scheduler.get("past"), None);
        assert_eq!(scheduler.len(), future_record_count(&records, now));

        // A second pass is a no-op
        assert!(scheduler.reconcile(records, now).is_empty());
    }

    #[test]
    fn test_reconcile_keeps_due_job_matching_record() {
        let mut scheduler = ExpirationScheduler::new();
        scheduler.schedule("alice", at(2025, 1, 1));

        let records = vec![("alice".to_string(), Expiry::At(at(2025, 1, 1)))];
        let result = scheduler.reconcile(records, at(2025, 1, 2));

        assert!(result.is_empty());
        assert_eq!(scheduler.pop_due(at(2025, 1, 2)).len(), 1);
    }
}
