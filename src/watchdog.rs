//! Top-level entry point the host application reports events to
//!
//! A `Watchdog` owns the whole pipeline: filtering, tracking, the notification
//! decision, the alert gate and reconciliation. `ingest` never fails and never
//! blocks on infrastructure; in async mode it only places the event on a
//! bounded queue.

use crate::aggregator::{
    with_timeout, AggregationStore, ErrorGroup, GroupQuery, InMemoryStore, SqliteStore,
};
use crate::alerts::{AlertManager, AlertOutcome, LogNotifier, Notifier};
use crate::analytics::{self, ErrorStatistics, ErrorSummary, TrendingError};
use crate::cache::{CounterCache, GroupSnapshots, LocalCounterCache};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, StoreError};
use crate::events::{Event, EventKind};
use crate::monitoring::{StatsSnapshot, TrackerStats};
use crate::reconcile::RetryPolicy;
use crate::tracker::{ReconcileReport, TrackOutcome, Tracker};
use crate::triggers::{Decision, DecisionEngine};
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Prefix of log targets emitted by this crate; events from them are dropped
const SELF_ORIGIN: &str = "errwatch";

/// Everything that happened to one processed event
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub outcome: TrackOutcome,
    /// `None` when there was no group to decide on
    pub decision: Option<Decision>,
    pub alert: Option<AlertOutcome>,
}

impl ProcessReport {
    fn skipped() -> Self {
        Self {
            outcome: TrackOutcome::Skipped,
            decision: None,
            alert: None,
        }
    }

    pub fn notified(&self) -> bool {
        self.alert == Some(AlertOutcome::Sent)
    }

    pub fn should_notify(&self) -> bool {
        self.decision.as_ref().map_or(false, |d| d.should_notify)
    }
}

/// Shared state used by callers and worker tasks alike
struct Pipeline {
    config: Config,
    enabled: AtomicBool,
    tracker: Tracker,
    engine: DecisionEngine,
    alerts: AlertManager,
    stats: Arc<TrackerStats>,
}

impl Pipeline {
    /// Normalize and filter an event; `None` means it is not tracked
    fn admit(&self, event: Event) -> Option<Event> {
        if !self.enabled.load(Ordering::Relaxed) {
            return None;
        }
        if event
            .origin
            .as_deref()
            .map_or(false, |origin| origin.starts_with(SELF_ORIGIN))
        {
            return None;
        }

        let event = event.normalize(&self.config.environment);

        if !self.config.environments.is_empty()
            && !self.config.environments.contains(&event.environment)
        {
            return None;
        }

        match &event.kind {
            EventKind::Exception { class, .. } => {
                if self.config.ignore_exceptions.iter().any(|c| c == class) {
                    return None;
                }
            }
            EventKind::Log => {
                if !self.config.report_levels.contains(&event.level) {
                    return None;
                }
            }
        }

        Some(event)
    }

    async fn handle(&self, event: Event) -> ProcessReport {
        let Some(event) = self.admit(event) else {
            self.stats.events_filtered.incr();
            return ProcessReport::skipped();
        };

        let outcome = self.tracker.track(&event).await;
        let Some(group) = outcome.group().cloned() else {
            return ProcessReport {
                outcome,
                decision: None,
                alert: None,
            };
        };

        let decision = self.engine.decide(group, Utc::now());
        let alert = self.alerts.dispatch(&decision).await;
        match &alert {
            AlertOutcome::Sent => {
                self.stats.notifications_sent.incr();
                self.tracker
                    .record_notification(&decision.group.fingerprint, Utc::now())
                    .await;
            }
            AlertOutcome::Suppressed => self.stats.notifications_suppressed.incr(),
            AlertOutcome::RateLimited => self.stats.notifications_rate_limited.incr(),
            AlertOutcome::Failed(_) => self.stats.notifications_failed.incr(),
        }

        ProcessReport {
            outcome,
            decision: Some(decision),
            alert: Some(alert),
        }
    }
}

/// Builder for a [`Watchdog`]
///
/// Anything not set explicitly is derived from the configuration: the store
/// from `store.path`, the cache tier from `cache.enabled`, and the notifier
/// defaults to [`LogNotifier`].
pub struct WatchdogBuilder {
    config: Config,
    store: Option<Arc<dyn AggregationStore>>,
    cache: Option<Option<Arc<dyn CounterCache>>>,
    notifier: Option<Arc<dyn Notifier>>,
    engine: Option<DecisionEngine>,
}

impl WatchdogBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config: config.sanitized(),
            store: None,
            cache: None,
            notifier: None,
            engine: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn AggregationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CounterCache>) -> Self {
        self.cache = Some(Some(cache));
        self
    }

    /// Run durable-only, regardless of `cache.enabled`
    pub fn without_cache(mut self) -> Self {
        self.cache = Some(None);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Replace the rule chain built from `[notification]`
    pub fn engine(mut self, engine: DecisionEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Assemble the pipeline and start background tasks
    ///
    /// Worker and reconciliation tasks need a Tokio runtime; without one the
    /// watchdog processes events inline and reconciles only when asked.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the configured SQLite database cannot be opened.
    pub fn build(self) -> Result<Watchdog, StoreError> {
        let config = self.config;

        let store: Arc<dyn AggregationStore> = match (self.store, &config.store.path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(SqliteStore::open(path)?),
            (None, None) => Arc::new(InMemoryStore::new()),
        };

        let window = Duration::from_secs(config.cache.ttl_seconds);
        let cache: Option<Arc<dyn CounterCache>> = match self.cache {
            Some(cache) => cache,
            None if config.cache.enabled => {
                let local: Arc<dyn CounterCache> =
                    Arc::new(LocalCounterCache::new(window, config.cache.max_entries));
                Some(local)
            }
            None => None,
        };

        let stats = Arc::new(TrackerStats::new());
        // Snapshots outlive the counter window so projections have something to start from
        let snapshots = GroupSnapshots::new(window.saturating_mul(2), config.cache.max_entries);
        let tracker = Tracker::new(
            store,
            cache,
            snapshots,
            RetryPolicy::from_config(&config.reconciliation),
            Arc::clone(&stats),
        )
        .with_key_prefix(config.cache.key_prefix.clone())
        .with_timeout(config.operation_timeout())
        .with_reopen_resolved(config.notification.reopen_resolved);

        let notifier: Arc<dyn Notifier> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(LogNotifier::new()),
        };
        let alerts = AlertManager::from_config(notifier, &config);
        let engine = self
            .engine
            .unwrap_or_else(|| DecisionEngine::from_config(&config.notification));

        let pipeline = Arc::new(Pipeline {
            enabled: AtomicBool::new(config.enabled),
            tracker,
            engine,
            alerts,
            stats,
            config,
        });

        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            warn!(
                target: "errwatch::internal",
                "No Tokio runtime available, processing events inline"
            );
        }

        let dispatcher = match &runtime {
            Some(handle) if pipeline.config.performance.async_enabled => {
                let worker_pipeline = Arc::clone(&pipeline);
                Some(Dispatcher::spawn(
                    handle,
                    pipeline.config.performance.workers,
                    pipeline.config.performance.queue_capacity,
                    move |event: Event| {
                        let pipeline = Arc::clone(&worker_pipeline);
                        async move {
                            pipeline.handle(event).await;
                        }
                    },
                ))
            }
            _ => None,
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let ticker = runtime.as_ref().map(|handle| {
            spawn_reconciler(
                handle,
                Arc::clone(&pipeline),
                Duration::from_secs(pipeline.config.reconciliation.interval_seconds),
                stop_rx,
            )
        });

        info!(
            "Watchdog started: async={} cache={} notifier={}",
            dispatcher.is_some(),
            pipeline.tracker.has_cache(),
            pipeline.alerts.notifier_name()
        );

        Ok(Watchdog {
            pipeline,
            dispatcher,
            stop: stop_tx,
            ticker: Mutex::new(ticker),
        })
    }
}

fn spawn_reconciler(
    runtime: &Handle,
    pipeline: Arc<Pipeline>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut ticks = tokio::time::interval(interval);
        // The first tick completes immediately
        ticks.tick().await;
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    pipeline.tracker.reconcile().await;
                }
                _ = stop.changed() => break,
            }
        }
        debug!("Reconciliation ticker stopped");
    })
}

/// Error aggregation and notification engine
///
/// `Send + Sync`; share it behind an `Arc`.
pub struct Watchdog {
    pipeline: Arc<Pipeline>,
    dispatcher: Option<Dispatcher<Event>>,
    stop: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn builder(config: Config) -> WatchdogBuilder {
        WatchdogBuilder::new(config)
    }

    /// Build a watchdog entirely from configuration
    pub fn from_config(config: Config) -> Result<Self, StoreError> {
        WatchdogBuilder::new(config).build()
    }

    /// Report an event
    ///
    /// In async mode the event is queued and this returns immediately; a full
    /// or closed queue drops the event. Otherwise the pipeline runs inline.
    /// Nothing is reported back to the caller either way.
    pub async fn ingest(&self, event: Event) {
        if !self.is_enabled() {
            return;
        }
        match &self.dispatcher {
            Some(_) => {
                // Counted and logged inside try_enqueue
                let _ = self.try_enqueue(event);
            }
            None => {
                self.process(event).await;
            }
        }
    }

    /// Queue an event for the worker pool without awaiting anything
    ///
    /// # Errors
    ///
    /// `DispatchError::QueueFull` or `DispatchError::Closed` when the event was
    /// dropped; also `Closed` when async mode is off.
    pub fn try_enqueue(&self, event: Event) -> Result<(), DispatchError> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.pipeline.stats.events_received.incr();

        let result = match &self.dispatcher {
            Some(dispatcher) => dispatcher.try_dispatch(event),
            None => Err(DispatchError::Closed),
        };
        if let Err(ref e) = result {
            self.pipeline.stats.events_dropped.incr();
            warn!(target: "errwatch::internal", "Dropped event: {}", e);
        }
        result
    }

    /// Run the full pipeline for one event in the caller's task
    pub async fn process(&self, event: Event) -> ProcessReport {
        self.pipeline.stats.events_received.incr();
        self.pipeline.handle(event).await
    }

    /// Flush pending occurrences whose retry time has come
    pub async fn reconcile(&self) -> ReconcileReport {
        self.pipeline.tracker.reconcile().await
    }

    /// Drain the queue, stop background tasks and flush everything pending
    pub async fn shutdown(&self) -> StatsSnapshot {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.shutdown().await;
        }

        let _ = self.stop.send(true);
        let ticker = match self.ticker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(ticker) = ticker {
            if let Err(e) = ticker.await {
                warn!(target: "errwatch::internal", "Reconciliation ticker ended abnormally: {}", e);
            }
        }

        let report = self.pipeline.tracker.reconcile_all().await;
        if report.retried > 0 {
            warn!(
                target: "errwatch::internal",
                "{} fingerprints still pending at shutdown", report.retried
            );
        }

        let stats = self.stats();
        stats.log_summary();
        stats
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.pipeline.stats.snapshot()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.pipeline.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.pipeline.enabled.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &Config {
        &self.pipeline.config
    }

    /// Occurrence batches waiting for reconciliation
    pub fn pending(&self) -> usize {
        self.pipeline.tracker.pending_len()
    }

    fn store(&self) -> &dyn AggregationStore {
        self.pipeline.tracker.store().as_ref()
    }

    pub async fn find(&self, fingerprint: &str) -> Result<Option<ErrorGroup>, StoreError> {
        with_timeout(
            self.config().operation_timeout(),
            self.store().find_by_fingerprint(fingerprint),
        )
        .await
    }

    pub async fn list(&self, query: GroupQuery) -> Result<Vec<ErrorGroup>, StoreError> {
        with_timeout(self.config().operation_timeout(), self.store().list(query)).await
    }

    /// Mark a group resolved; returns `false` for unknown fingerprints
    pub async fn resolve(&self, fingerprint: &str) -> Result<bool, StoreError> {
        self.pipeline.tracker.resolve(fingerprint, Utc::now()).await
    }

    /// A group together with its analysis summary
    pub async fn summary(
        &self,
        fingerprint: &str,
    ) -> Result<Option<(ErrorGroup, ErrorSummary)>, StoreError> {
        Ok(self.find(fingerprint).await?.map(|group| {
            let summary = ErrorSummary::for_group(&group);
            (group, summary)
        }))
    }

    pub async fn statistics(&self) -> Result<ErrorStatistics, StoreError> {
        analytics::collect_statistics(self.store(), Utc::now()).await
    }

    pub async fn trending(&self) -> Result<Vec<TrendingError>, StoreError> {
        analytics::trending_analysis(self.store(), Utc::now()).await
    }

    pub async fn similar(&self, fingerprint: &str, limit: usize) -> Result<Vec<ErrorGroup>, StoreError> {
        analytics::find_similar(self.store(), fingerprint, limit).await
    }

    /// Delete old resolved groups; `None` uses `retention.resolved_days`
    pub async fn cleanup(&self, days_to_keep: Option<u32>) -> Result<u64, StoreError> {
        let days = days_to_keep.unwrap_or(self.config().retention.resolved_days);
        let deleted = analytics::cleanup(self.store(), days, Utc::now()).await?;
        info!("Deleted {} resolved groups older than {} days", deleted, days);
        Ok(deleted)
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("enabled", &self.is_enabled())
            .field("async", &self.dispatcher.is_some())
            .field("tracker", &self.pipeline.tracker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::MockNotifier;
    use crate::events::Level;

    fn sync_config() -> Config {
        let mut config = Config::default();
        config.performance.async_enabled = false;
        config
    }

    fn watchdog(config: Config, notifier: &MockNotifier) -> Watchdog {
        Watchdog::builder(config)
            .without_cache()
            .notifier(Arc::new(notifier.clone()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_filters() {
        let mut config = sync_config();
        config.environments = vec!["production".to_string()];
        config.ignore_exceptions = vec!["NotFound".to_string()];
        let wd = watchdog(config, &MockNotifier::new());

        let staging = Event::exception("Boom", "m", Level::Error, "staging");
        assert!(matches!(wd.process(staging).await.outcome, TrackOutcome::Skipped));

        let ignored = Event::exception("NotFound", "m", Level::Error, "production");
        assert!(matches!(wd.process(ignored).await.outcome, TrackOutcome::Skipped));

        let quiet_log = Event::log(Level::Info, "hello", "production");
        assert!(matches!(wd.process(quiet_log).await.outcome, TrackOutcome::Skipped));

        let own = Event::log(Level::Error, "store down", "production").with_origin("errwatch::internal");
        assert!(matches!(wd.process(own).await.outcome, TrackOutcome::Skipped));

        // Empty environment takes the configured default
        let defaulted = Event::exception("Boom", "m", Level::Error, "");
        assert!(matches!(wd.process(defaulted).await.outcome, TrackOutcome::Created(_)));

        assert_eq!(wd.stats().events_filtered, 4);
    }

    #[tokio::test]
    async fn test_disabled_is_a_no_op() {
        let notifier = MockNotifier::new();
        let wd = watchdog(sync_config(), &notifier);
        wd.set_enabled(false);

        wd.ingest(Event::exception("Boom", "m", Level::Emergency, "production")).await;
        assert_eq!(wd.stats(), StatsSnapshot::default());
        assert!(wd.list(GroupQuery::default()).await.unwrap().is_empty());
        assert_eq!(notifier.call_count(), 0);
    }

    #[tokio::test]
    async fn test_critical_event_notifies_once_recorded() {
        let notifier = MockNotifier::new();
        let wd = watchdog(sync_config(), &notifier);

        let report = wd
            .process(Event::exception("Boom", "m", Level::Critical, "production"))
            .await;
        assert!(report.notified());

        let fp = report.outcome.fingerprint().unwrap().to_string();
        let group = wd.find(&fp).await.unwrap().unwrap();
        assert!(group.notification_sent);
        assert_eq!(notifier.call_count(), 1);
        assert_eq!(wd.stats().notifications_sent, 1);
    }

    #[tokio::test]
    async fn test_failed_notification_is_not_recorded() {
        let notifier = MockNotifier::failing();
        let wd = watchdog(sync_config(), &notifier);

        let report = wd
            .process(Event::exception("Boom", "m", Level::Critical, "production"))
            .await;
        assert!(report.should_notify());
        assert!(!report.notified());

        let fp = report.outcome.fingerprint().unwrap().to_string();
        assert!(!wd.find(&fp).await.unwrap().unwrap().notification_sent);
        assert_eq!(wd.stats().notifications_failed, 1);
    }

    #[tokio::test]
    async fn test_async_ingest_and_shutdown() {
        let wd = Watchdog::builder(Config::default())
            .notifier(Arc::new(MockNotifier::new()))
            .build()
            .unwrap();

        for _ in 0..5 {
            wd.ingest(Event::exception("Boom", "m", Level::Error, "production")).await;
        }
        let stats = wd.shutdown().await;
        assert_eq!(stats.events_received, 5);
        assert_eq!(wd.pending(), 0);

        let groups = wd.list(GroupQuery::default()).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].occurrence_count, 5);
    }

    #[tokio::test]
    async fn test_resolve_summary_and_cleanup() {
        let wd = watchdog(sync_config(), &MockNotifier::new());
        let report = wd
            .process(Event::exception("Boom", "m", Level::Warning, "production"))
            .await;
        let fp = report.outcome.fingerprint().unwrap().to_string();

        let (group, summary) = wd.summary(&fp).await.unwrap().unwrap();
        assert_eq!(group.occurrence_count, 1);
        assert_eq!(summary.frequency_analysis, "First occurrence");

        assert!(wd.resolve(&fp).await.unwrap());
        assert!(!wd.resolve("missing").await.unwrap());
        // Resolved just now, so nothing is old enough to delete
        assert_eq!(wd.cleanup(None).await.unwrap(), 0);
        assert_eq!(wd.statistics().await.unwrap().unresolved_errors, 0);
    }
}
