//! Self-monitoring counters for the tracking pipeline
//!
//! Every soft failure the pipeline absorbs (cache or store errors, timeouts,
//! dropped events, failed notifications) is counted here so that degradation
//! stays visible even though nothing is reported to the host application.

use log::info;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter that can be bumped from any task
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Live counters shared by the tracker, dispatcher and alert gate
#[derive(Debug, Default)]
pub struct TrackerStats {
    pub events_received: Counter,
    /// Discarded by the enabled flag, environment, ignore list, level or origin filters
    pub events_filtered: Counter,
    /// Lost because the dispatch queue was full or closed
    pub events_dropped: Counter,
    pub groups_created: Counter,
    pub occurrences_recorded: Counter,
    pub deferred_occurrences: Counter,
    pub cache_failures: Counter,
    pub store_failures: Counter,
    pub timeouts: Counter,
    pub notifications_sent: Counter,
    pub notifications_suppressed: Counter,
    pub notifications_rate_limited: Counter,
    pub notifications_failed: Counter,
    pub reconciliation_flushed: Counter,
    pub reconciliation_retried: Counter,
    pub reconciliation_dropped: Counter,
}

/// Point-in-time copy of the tracker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub events_filtered: u64,
    pub events_dropped: u64,
    pub groups_created: u64,
    pub occurrences_recorded: u64,
    pub deferred_occurrences: u64,
    pub cache_failures: u64,
    pub store_failures: u64,
    pub timeouts: u64,
    pub notifications_sent: u64,
    pub notifications_suppressed: u64,
    pub notifications_rate_limited: u64,
    pub notifications_failed: u64,
    pub reconciliation_flushed: u64,
    pub reconciliation_retried: u64,
    pub reconciliation_dropped: u64,
}

impl TrackerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_received: self.events_received.get(),
            events_filtered: self.events_filtered.get(),
            events_dropped: self.events_dropped.get(),
            groups_created: self.groups_created.get(),
            occurrences_recorded: self.occurrences_recorded.get(),
            deferred_occurrences: self.deferred_occurrences.get(),
            cache_failures: self.cache_failures.get(),
            store_failures: self.store_failures.get(),
            timeouts: self.timeouts.get(),
            notifications_sent: self.notifications_sent.get(),
            notifications_suppressed: self.notifications_suppressed.get(),
            notifications_rate_limited: self.notifications_rate_limited.get(),
            notifications_failed: self.notifications_failed.get(),
            reconciliation_flushed: self.reconciliation_flushed.get(),
            reconciliation_retried: self.reconciliation_retried.get(),
            reconciliation_dropped: self.reconciliation_dropped.get(),
        }
    }
}

impl StatsSnapshot {
    /// Share of notifier calls that succeeded, as a percentage (0-100)
    ///
    /// Returns 100 when no notification has been attempted.
    pub fn notification_success_rate(&self) -> f64 {
        let attempted = self.notifications_sent + self.notifications_failed;
        if attempted == 0 {
            100.0
        } else {
            self.notifications_sent as f64 / attempted as f64 * 100.0
        }
    }

    /// Write a one-line summary at info level
    pub fn log_summary(&self) {
        info!(
            "Tracker stats: received={} filtered={} dropped={} created={} recorded={} deferred={} \
             cache_failures={} store_failures={} timeouts={} sent={} suppressed={} rate_limited={} \
             failed={} reconciled={} retried={} reconcile_dropped={}",
            self.events_received,
            self.events_filtered,
            self.events_dropped,
            self.groups_created,
            self.occurrences_recorded,
            self.deferred_occurrences,
            self.cache_failures,
            self.store_failures,
            self.timeouts,
            self.notifications_sent,
            self.notifications_suppressed,
            self.notifications_rate_limited,
            self.notifications_failed,
            self.reconciliation_flushed,
            self.reconciliation_retried,
            self.reconciliation_dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = TrackerStats::new();
        stats.events_received.add(3);
        stats.store_failures.incr();
        stats.notifications_sent.incr();

        let snap = stats.snapshot();
        assert_eq!(snap.events_received, 3);
        assert_eq!(snap.store_failures, 1);
        assert_eq!(snap.notifications_sent, 1);
        assert_eq!(snap.events_dropped, 0);
    }

    #[test]
    fn test_notification_success_rate() {
        let mut snap = StatsSnapshot::default();
        assert_eq!(snap.notification_success_rate(), 100.0);

        snap.notifications_sent = 3;
        snap.notifications_failed = 1;
        assert_eq!(snap.notification_success_rate(), 75.0);
    }

    #[test]
    fn test_counters_are_shared_across_threads() {
        let stats = Arc::new(TrackerStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        stats.events_received.incr();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().events_received, 800);
    }
}
