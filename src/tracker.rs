//! Fast/durable dual-path occurrence tracking
//!
//! The first occurrence of a fingerprint in a cache window is written through
//! to the store; repeats inside the window are parked in the reconciliation
//! queue and answered with an in-memory projection of the group. Without a
//! cache tier every occurrence is written through.

use crate::aggregator::{
    with_timeout, AggregationStore, ErrorGroup, NewErrorGroup, OccurrenceUpdate,
};
use crate::cache::{counter_key, CounterCache, GroupSnapshots};
use crate::error::{CacheError, StoreError};
use crate::events::{Event, Timestamp};
use crate::fingerprint::fingerprint;
use crate::monitoring::TrackerStats;
use crate::reconcile::{persist, PendingOccurrence, Persisted, ReconciliationQueue, RetryPolicy};
use log::{debug, error, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What tracking one occurrence produced
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum TrackOutcome {
    /// The occurrence created a new group
    Created(ErrorGroup),
    /// The occurrence was written to an existing group
    Updated(ErrorGroup),
    /// The occurrence is waiting in the reconciliation queue
    ///
    /// `projected` is the last durable snapshot with the pending occurrences
    /// applied, or `None` when no snapshot is held or the write failed.
    Deferred {
        fingerprint: String,
        window_count: u64,
        projected: Option<ErrorGroup>,
    },
    /// The event was filtered out before tracking
    Skipped,
}

impl TrackOutcome {
    /// The group a notification decision can be made on, if any
    pub fn group(&self) -> Option<&ErrorGroup> {
        match self {
            TrackOutcome::Created(group) | TrackOutcome::Updated(group) => Some(group),
            TrackOutcome::Deferred { projected, .. } => projected.as_ref(),
            TrackOutcome::Skipped => None,
        }
    }

    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            TrackOutcome::Created(group) | TrackOutcome::Updated(group) => Some(&group.fingerprint),
            TrackOutcome::Deferred { fingerprint, .. } => Some(fingerprint),
            TrackOutcome::Skipped => None,
        }
    }
}

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub flushed: u64,
    pub retried: u64,
    pub dropped: u64,
}

/// Tracking service tying the cache tier, the store and reconciliation together
pub struct Tracker {
    store: Arc<dyn AggregationStore>,
    cache: Option<Arc<dyn CounterCache>>,
    snapshots: GroupSnapshots,
    pending: ReconciliationQueue,
    stats: Arc<TrackerStats>,
    key_prefix: String,
    timeout: Duration,
    reopen_resolved: bool,
}

impl Tracker {
    /// Create a tracker
    ///
    /// # Arguments
    ///
    /// * `store` - Durable aggregation store
    /// * `cache` - Optional fast counter tier
    /// * `snapshots` - Snapshot cache used for deferred projections
    /// * `policy` - Retry policy for the reconciliation queue
    /// * `stats` - Shared self-monitoring counters
    pub fn new(
        store: Arc<dyn AggregationStore>,
        cache: Option<Arc<dyn CounterCache>>,
        snapshots: GroupSnapshots,
        policy: RetryPolicy,
        stats: Arc<TrackerStats>,
    ) -> Self {
        Self {
            store,
            cache,
            snapshots,
            pending: ReconciliationQueue::new(policy),
            stats,
            key_prefix: "watchdog".to_string(),
            timeout: Duration::from_secs(1),
            reopen_resolved: false,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Upper bound for every cache and store call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_reopen_resolved(mut self, reopen: bool) -> Self {
        self.reopen_resolved = reopen;
        self
    }

    pub fn store(&self) -> &Arc<dyn AggregationStore> {
        &self.store
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Occurrence batches waiting for reconciliation
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Track one normalized event
    ///
    /// Never fails: cache problems fall back to the durable path and store
    /// problems park the occurrence for reconciliation.
    pub async fn track(&self, event: &Event) -> TrackOutcome {
        let fp = fingerprint(event);
        let at = event.timestamp;
        let template = NewErrorGroup::from_event(event, &fp, at, self.reopen_resolved);
        let update = OccurrenceUpdate::from_event(event, at, self.reopen_resolved);

        match self.window_count(&fp).await {
            Some(window_count) if window_count > 1 => {
                self.defer(template, update, window_count).await
            }
            window_count => self.write_through(template, update, window_count).await,
        }
    }

    /// Increment the cache counter, or `None` when the tier is absent or failing
    async fn window_count(&self, fp: &str) -> Option<u64> {
        let cache = self.cache.as_ref()?;
        let key = counter_key(&self.key_prefix, fp);

        let result = match tokio::time::timeout(self.timeout, cache.increment(&key)).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.timeouts.incr();
                Err(CacheError::Timeout)
            }
        };

        match result {
            Ok(count) => Some(count),
            Err(e) => {
                self.stats.cache_failures.incr();
                warn!(
                    target: "errwatch::internal",
                    "Counter cache failed for {}, using durable path: {}", fp, e
                );
                None
            }
        }
    }

    async fn defer(
        &self,
        template: NewErrorGroup,
        update: OccurrenceUpdate,
        window_count: u64,
    ) -> TrackOutcome {
        let fingerprint = template.fingerprint.clone();
        self.stats.deferred_occurrences.incr();

        let projected = self.snapshots.project(&fingerprint, &update).await;
        self.park(PendingOccurrence::new(template, update)).await;

        debug!(
            "Deferred occurrence {} of {} in current window",
            window_count, fingerprint
        );
        TrackOutcome::Deferred {
            fingerprint,
            window_count,
            projected,
        }
    }

    async fn write_through(
        &self,
        template: NewErrorGroup,
        update: OccurrenceUpdate,
        window_count: Option<u64>,
    ) -> TrackOutcome {
        // Fold in anything still pending so it reaches the store with this write
        let mut entry = match self.pending.take(&template.fingerprint) {
            Some(mut pending) => {
                pending.update.absorb(update);
                pending
            }
            None => PendingOccurrence::new(template, update),
        };

        let count = entry.update.count;
        match persist(
            self.store.as_ref(),
            &entry.template,
            &mut entry.update,
            self.timeout,
        )
        .await
        {
            Ok(persisted) => {
                self.stats.occurrences_recorded.add(count);
                self.snapshots.remember(persisted.group()).await;
                match persisted {
                    Persisted::Created(group) => {
                        self.stats.groups_created.incr();
                        TrackOutcome::Created(group)
                    }
                    Persisted::Updated(group) => TrackOutcome::Updated(group),
                }
            }
            Err(e) => {
                self.note_store_failure(&e);
                warn!(
                    target: "errwatch::internal",
                    "Durable write failed for {}, queued for reconciliation: {}",
                    entry.template.fingerprint, e
                );
                let fingerprint = entry.template.fingerprint.clone();
                self.park(entry).await;
                TrackOutcome::Deferred {
                    fingerprint,
                    window_count: window_count.unwrap_or(0),
                    projected: None,
                }
            }
        }
    }

    /// Queue an entry, giving an evicted entry one last flush attempt
    async fn park(&self, entry: PendingOccurrence) {
        let Some(mut evicted) = self.pending.enqueue(entry) else {
            return;
        };

        let count = evicted.update.count;
        match persist(
            self.store.as_ref(),
            &evicted.template,
            &mut evicted.update,
            self.timeout,
        )
        .await
        {
            Ok(_) => {
                self.stats.occurrences_recorded.add(count);
                self.stats.reconciliation_flushed.incr();
            }
            Err(e) => {
                self.note_store_failure(&e);
                self.stats.reconciliation_dropped.incr();
                error!(
                    target: "errwatch::internal",
                    "Reconciliation queue full, dropped {} occurrences of {}: {}",
                    evicted.update.count,
                    evicted.template.fingerprint,
                    e
                );
            }
        }
    }

    /// Flush every pending entry whose retry time has come
    pub async fn reconcile(&self) -> ReconcileReport {
        let due = self.pending.take_due(Instant::now());
        self.flush(due).await
    }

    /// Flush every pending entry, ignoring backoff
    pub async fn reconcile_all(&self) -> ReconcileReport {
        let all = self.pending.take_all();
        self.flush(all).await
    }

    async fn flush(&self, entries: Vec<PendingOccurrence>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for mut entry in entries {
            let count = entry.update.count;
            match persist(
                self.store.as_ref(),
                &entry.template,
                &mut entry.update,
                self.timeout,
            )
            .await
            {
                Ok(persisted) => {
                    if matches!(persisted, Persisted::Created(_)) {
                        self.stats.groups_created.incr();
                    }
                    self.stats.occurrences_recorded.add(count);
                    self.stats.reconciliation_flushed.incr();
                    report.flushed += 1;
                }
                Err(e) => {
                    self.note_store_failure(&e);
                    let fingerprint = entry.template.fingerprint.clone();
                    let remaining = entry.update.count;
                    if self.pending.requeue(entry) {
                        self.stats.reconciliation_retried.incr();
                        report.retried += 1;
                    } else {
                        self.stats.reconciliation_dropped.incr();
                        report.dropped += 1;
                        error!(
                            target: "errwatch::internal",
                            "Giving up on {} pending occurrences of {}: {}",
                            remaining, fingerprint, e
                        );
                    }
                }
            }
        }

        if report != ReconcileReport::default() {
            debug!(
                "Reconciliation: flushed={} retried={} dropped={}",
                report.flushed, report.retried, report.dropped
            );
        }
        report
    }

    /// Record a sent notification in the store and the snapshot cache
    pub async fn record_notification(&self, fingerprint: &str, at: Timestamp) {
        self.snapshots.note_notified(fingerprint, at).await;
        if let Err(e) = with_timeout(
            self.timeout,
            self.store.record_notification_sent(fingerprint, at),
        )
        .await
        {
            self.note_store_failure(&e);
            warn!(
                target: "errwatch::internal",
                "Failed to record notification for {}: {}", fingerprint, e
            );
        }
    }

    /// Mark a group resolved in the store and the snapshot cache
    pub async fn resolve(&self, fingerprint: &str, at: Timestamp) -> Result<bool, StoreError> {
        let resolved = with_timeout(self.timeout, self.store.mark_resolved(fingerprint, at)).await?;
        if resolved {
            self.snapshots.note_resolved(fingerprint, at).await;
        }
        Ok(resolved)
    }

    fn note_store_failure(&self, e: &StoreError) {
        self.stats.store_failures.incr();
        if matches!(e, StoreError::Timeout) {
            self.stats.timeouts.incr();
        }
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("cache", &self.cache.is_some())
            .field("pending", &self.pending.len())
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{FaultyStore, InMemoryStore};
    use crate::cache::{FaultyCache, LocalCounterCache};
    use crate::events::Level;

    fn snapshots() -> GroupSnapshots {
        GroupSnapshots::new(Duration::from_secs(300), 1000)
    }

    fn immediate_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_pending: 100,
        }
    }

    fn tracker(
        store: Arc<dyn AggregationStore>,
        cache: Option<Arc<dyn CounterCache>>,
    ) -> Tracker {
        Tracker::new(store, cache, snapshots(), immediate_retry(), Arc::new(TrackerStats::new()))
            .with_timeout(Duration::from_millis(200))
    }

    fn event() -> Event {
        Event::exception("NullPointer", "x undefined", Level::Error, "production").at("f.rs", 10)
    }

    #[tokio::test]
    async fn test_durable_only_path() {
        let store = Arc::new(InMemoryStore::new());
        let t = tracker(store.clone(), None);

        assert!(matches!(t.track(&event()).await, TrackOutcome::Created(_)));
        match t.track(&event()).await {
            TrackOutcome::Updated(group) => assert_eq!(group.occurrence_count, 2),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(t.stats.snapshot().groups_created, 1);
    }

    #[tokio::test]
    async fn test_cache_repeats_are_deferred_and_projected() {
        let store = Arc::new(InMemoryStore::new());
        let cache: Arc<dyn CounterCache> =
            Arc::new(LocalCounterCache::new(Duration::from_secs(300), 1000));
        let t = tracker(store.clone(), Some(cache));

        assert!(matches!(t.track(&event()).await, TrackOutcome::Created(_)));
        match t.track(&event()).await {
            TrackOutcome::Deferred {
                window_count,
                projected: Some(group),
                ..
            } => {
                assert_eq!(window_count, 2);
                assert_eq!(group.occurrence_count, 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let fp = fingerprint(&event());
        assert_eq!(store.find_by_fingerprint(&fp).await.unwrap().unwrap().occurrence_count, 1);

        let report = t.reconcile().await;
        assert_eq!(report.flushed, 1);
        assert_eq!(store.find_by_fingerprint(&fp).await.unwrap().unwrap().occurrence_count, 2);
    }

    #[tokio::test]
    async fn test_failing_cache_falls_back_to_store() {
        let store = Arc::new(InMemoryStore::new());
        let cache: Arc<dyn CounterCache> = Arc::new(FaultyCache::failing());
        let t = tracker(store.clone(), Some(cache));

        t.track(&event()).await;
        t.track(&event()).await;

        assert_eq!(t.stats.snapshot().cache_failures, 2);
        let fp = fingerprint(&event());
        assert_eq!(store.find_by_fingerprint(&fp).await.unwrap().unwrap().occurrence_count, 2);
    }

    #[tokio::test]
    async fn test_store_failure_is_reconciled_later() {
        let store = Arc::new(FaultyStore::failing());
        let t = tracker(store.clone(), None);

        let outcome = t.track(&event()).await;
        assert!(matches!(
            outcome,
            TrackOutcome::Deferred {
                projected: None,
                ..
            }
        ));
        assert!(outcome.group().is_none());
        t.track(&event()).await;
        assert_eq!(t.pending_len(), 1);
        assert_eq!(t.stats.snapshot().store_failures, 2);

        store.set_failing(false);
        let report = t.reconcile().await;
        assert_eq!(report.flushed, 1);

        let fp = fingerprint(&event());
        let group = store.inner().find_by_fingerprint(&fp).await.unwrap().unwrap();
        assert_eq!(group.occurrence_count, 2);
    }

    #[tokio::test]
    async fn test_reconcile_drops_after_max_attempts() {
        let store = Arc::new(FaultyStore::failing());
        let t = tracker(store, None);

        t.track(&event()).await;
        let mut dropped = 0;
        for _ in 0..5 {
            dropped += t.reconcile().await.dropped;
        }
        assert_eq!(dropped, 1);
        assert_eq!(t.pending_len(), 0);
        assert_eq!(t.stats.snapshot().reconciliation_dropped, 1);
    }

    #[tokio::test]
    async fn test_hanging_store_times_out() {
        let store = Arc::new(FaultyStore::healthy().with_delay(Duration::from_secs(5)));
        let t = tracker(store, None);

        let started = std::time::Instant::now();
        t.track(&event()).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(t.stats.snapshot().timeouts, 1);
    }

    #[tokio::test]
    async fn test_record_notification_updates_store_and_snapshot() {
        let store = Arc::new(InMemoryStore::new());
        let t = tracker(store.clone(), None);
        let fp = t.track(&event()).await.fingerprint().unwrap().to_string();

        let at = chrono::Utc::now();
        t.record_notification(&fp, at).await;

        let group = store.find_by_fingerprint(&fp).await.unwrap().unwrap();
        assert!(group.notification_sent);
        assert_eq!(group.last_notification_at, Some(at));
        assert_eq!(
            t.snapshots.get(&fp).await.unwrap().last_notification_at,
            Some(at)
        );

        assert!(t.resolve(&fp, at).await.unwrap());
        let snapshot = t.snapshots.get(&fp).await.unwrap();
        assert!(snapshot.is_resolved);
        assert_eq!(snapshot.resolved_at, Some(at));
    }
}
