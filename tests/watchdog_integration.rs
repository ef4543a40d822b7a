use errwatch::aggregator::{AggregationStore, FaultyStore, GroupQuery, InMemoryStore, SqliteStore};
use errwatch::alerts::{AlertOutcome, MockNotifier, RateLimiter};
use errwatch::cache::{CounterCache, FaultyCache, LocalCounterCache};
use errwatch::config::Config;
use errwatch::events::{Event, Level};
use errwatch::{TrackOutcome, Watchdog};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn sync_config() -> Config {
    let mut config = Config::default();
    config.performance.async_enabled = false;
    config
}

fn null_pointer(level: Level) -> Event {
    Event::exception("NullPointer", "x undefined", level, "prod").at("f", 10)
}

fn local_cache() -> Arc<dyn CounterCache> {
    Arc::new(LocalCounterCache::new(Duration::from_secs(300), 10_000))
}

/// Eleven occurrences in an hour, then cooldown behaviour once a notification lands
async fn run_scenario(watchdog: &Watchdog, notifier: &MockNotifier) {
    notifier.set_failing(true);

    for n in 1..=9 {
        let report = watchdog.process(null_pointer(Level::Warning)).await;
        assert!(!report.should_notify(), "occurrence {} should not notify", n);
    }

    // Threshold reached; the notifier fails so nothing is recorded yet
    for _ in 10..=11 {
        let report = watchdog.process(null_pointer(Level::Warning)).await;
        assert!(report.should_notify());
        assert!(matches!(report.alert, Some(AlertOutcome::Failed(_))));
    }

    notifier.set_failing(false);
    let report = watchdog.process(null_pointer(Level::Warning)).await;
    assert!(report.notified());

    // Inside the cooldown after a recorded notification
    let report = watchdog.process(null_pointer(Level::Warning)).await;
    assert!(!report.should_notify());
    assert_eq!(
        report.decision.unwrap().decided_by.as_deref(),
        Some("CooldownRule")
    );

    // Severity alone still clears min_severity
    let report = watchdog.process(null_pointer(Level::Critical)).await;
    assert!(report.should_notify());
    assert_eq!(
        report.decision.unwrap().decided_by.as_deref(),
        Some("SeverityRule")
    );

    assert_eq!(notifier.call_count(), 2);
}

fn scenario_config() -> Config {
    let mut config = sync_config();
    // Keep the hourly rule out of the way so the frequency rule decides
    config.notification.hourly_threshold = 100;
    config
}

#[tokio::test]
async fn test_scenario_durable_only() {
    let notifier = MockNotifier::new();
    let watchdog = Watchdog::builder(scenario_config())
        .without_cache()
        .notifier(Arc::new(notifier.clone()))
        .build()
        .unwrap();

    run_scenario(&watchdog, &notifier).await;

    let groups = watchdog.list(GroupQuery::default()).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].occurrence_count, 14);
    assert!(groups[0].notification_sent);
}

#[tokio::test]
async fn test_scenario_with_cache_tier() {
    let notifier = MockNotifier::new();
    let watchdog = Watchdog::builder(scenario_config())
        .cache(local_cache())
        .notifier(Arc::new(notifier.clone()))
        .build()
        .unwrap();

    run_scenario(&watchdog, &notifier).await;

    watchdog.shutdown().await;
    let groups = watchdog.list(GroupQuery::default()).await.unwrap();
    assert_eq!(groups[0].occurrence_count, 14);
    assert!(groups[0].notification_sent);
}

#[tokio::test]
async fn test_decision_precedence_examples() {
    let notifier = MockNotifier::new();
    let watchdog = Watchdog::builder(sync_config())
        .without_cache()
        .notifier(Arc::new(notifier.clone()))
        .build()
        .unwrap();

    // Emergency fatal error: severity 10 on the first occurrence
    let report = watchdog
        .process(Event::exception("TypeError", "boom", Level::Emergency, "prod"))
        .await;
    assert!(report.should_notify());

    // Notice log: severity 2, count 1, hourly 1
    let mut config = sync_config();
    config.report_levels.push(Level::Notice);
    let quiet = Watchdog::builder(config)
        .without_cache()
        .notifier(Arc::new(MockNotifier::new()))
        .build()
        .unwrap();
    let report = quiet.process(Event::log(Level::Notice, "disk slow", "prod")).await;
    match &report.outcome {
        TrackOutcome::Created(group) => assert_eq!(group.severity_score, 2),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!report.should_notify());
}

async fn concurrent_ingest(watchdog: Arc<Watchdog>, n: usize) -> u64 {
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let watchdog = Arc::clone(&watchdog);
            tokio::spawn(async move {
                watchdog.process(null_pointer(Level::Error)).await;
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    watchdog.shutdown().await;
    let groups = watchdog.list(GroupQuery::default()).await.unwrap();
    assert_eq!(groups.len(), 1);
    groups[0].occurrence_count
}

fn concurrent_watchdog(store: Arc<dyn AggregationStore>, cache: Option<Arc<dyn CounterCache>>) -> Arc<Watchdog> {
    let builder = Watchdog::builder(sync_config())
        .store(store)
        .notifier(Arc::new(MockNotifier::new()));
    let builder = match cache {
        Some(cache) => builder.cache(cache),
        None => builder.without_cache(),
    };
    Arc::new(builder.build().unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_in_memory_without_cache() {
    let watchdog = concurrent_watchdog(Arc::new(InMemoryStore::new()), None);
    assert_eq!(concurrent_ingest(watchdog, 50).await, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_in_memory_with_cache() {
    let watchdog = concurrent_watchdog(Arc::new(InMemoryStore::new()), Some(local_cache()));
    assert_eq!(concurrent_ingest(watchdog, 50).await, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sqlite_without_cache() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("errors.db")).unwrap());
    let watchdog = concurrent_watchdog(store, None);
    assert_eq!(concurrent_ingest(watchdog, 50).await, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sqlite_with_cache() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("errors.db")).unwrap());
    let watchdog = concurrent_watchdog(store, Some(local_cache()));
    assert_eq!(concurrent_ingest(watchdog, 50).await, 50);
}

#[tokio::test]
async fn test_async_ingest_counts_every_event() {
    let watchdog = Watchdog::builder(Config::default())
        .notifier(Arc::new(MockNotifier::new()))
        .build()
        .unwrap();

    for _ in 0..20 {
        watchdog.ingest(null_pointer(Level::Error)).await;
    }
    let stats = watchdog.shutdown().await;
    assert_eq!(stats.events_received, 20);
    assert_eq!(stats.events_dropped, 0);

    let groups = watchdog.list(GroupQuery::default()).await.unwrap();
    assert_eq!(groups[0].occurrence_count, 20);
}

#[tokio::test]
async fn test_fault_injection_completes_in_bounded_time() {
    let mut config = sync_config();
    config.performance.operation_timeout_ms = 100;

    let store = Arc::new(FaultyStore::failing().with_delay(Duration::from_secs(5)));
    let cache: Arc<dyn CounterCache> =
        Arc::new(FaultyCache::failing().with_delay(Duration::from_secs(5)));
    let watchdog = Watchdog::builder(config)
        .store(store)
        .cache(cache)
        .notifier(Arc::new(MockNotifier::new().with_delay(Duration::from_secs(5))))
        .build()
        .unwrap();

    let started = Instant::now();
    for _ in 0..3 {
        let report = watchdog.process(null_pointer(Level::Emergency)).await;
        assert!(report.decision.is_none());
    }
    assert!(started.elapsed() < Duration::from_secs(3));

    let stats = watchdog.stats();
    assert_eq!(stats.cache_failures, 3);
    assert_eq!(stats.store_failures, 3);
    assert!(stats.timeouts >= 6);
    assert_eq!(watchdog.pending(), 1);
}

#[tokio::test]
async fn test_failing_store_recovers_through_reconciliation() {
    let store = Arc::new(FaultyStore::failing());
    let watchdog = Watchdog::builder(sync_config())
        .store(store.clone())
        .without_cache()
        .notifier(Arc::new(MockNotifier::new()))
        .build()
        .unwrap();

    for _ in 0..3 {
        watchdog.process(null_pointer(Level::Error)).await;
    }
    store.set_failing(false);
    let report = watchdog.reconcile().await;
    assert_eq!(report.flushed, 1);

    let groups = store.inner().list(GroupQuery::default()).await.unwrap();
    assert_eq!(groups[0].occurrence_count, 3);
}

#[test]
fn test_rate_limiter_boundary() {
    let limiter = RateLimiter::new(2, 10);
    let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

    let granted = (0..3)
        .filter(|_| limiter.try_acquire_at("exception", at))
        .count();
    assert_eq!(granted, 2);
}

#[tokio::test]
async fn test_disabled_and_self_reported_events_are_ignored() {
    let notifier = MockNotifier::new();
    let watchdog = Watchdog::builder(sync_config())
        .without_cache()
        .notifier(Arc::new(notifier.clone()))
        .build()
        .unwrap();

    let own = Event::log(Level::Critical, "store unavailable", "prod").with_origin("errwatch::internal");
    watchdog.ingest(own).await;

    watchdog.set_enabled(false);
    watchdog.ingest(null_pointer(Level::Emergency)).await;
    watchdog.set_enabled(true);

    assert!(watchdog.list(GroupQuery::default()).await.unwrap().is_empty());
    assert_eq!(notifier.call_count(), 0);
    assert_eq!(watchdog.stats().events_filtered, 1);
}

#[tokio::test]
async fn test_resolved_groups_stay_resolved_by_default() {
    let watchdog = Watchdog::builder(sync_config())
        .without_cache()
        .notifier(Arc::new(MockNotifier::new()))
        .build()
        .unwrap();

    let report = watchdog.process(null_pointer(Level::Error)).await;
    let fp = report.outcome.fingerprint().unwrap().to_string();
    assert!(watchdog.resolve(&fp).await.unwrap());

    watchdog.process(null_pointer(Level::Error)).await;
    let group = watchdog.find(&fp).await.unwrap().unwrap();
    assert!(group.is_resolved);
    assert_eq!(group.occurrence_count, 2);

    let mut config = sync_config();
    config.notification.reopen_resolved = true;
    let reopening = Watchdog::builder(config)
        .without_cache()
        .notifier(Arc::new(MockNotifier::new()))
        .build()
        .unwrap();
    reopening.process(null_pointer(Level::Error)).await;
    assert!(reopening.resolve(&fp).await.unwrap());
    reopening.process(null_pointer(Level::Error)).await;
    assert!(!reopening.find(&fp).await.unwrap().unwrap().is_resolved);
}

#[tokio::test]
async fn test_critical_recurrence_after_resolve_notifies_with_either_tier() {
    for cache in [Some(local_cache()), None] {
        let with_cache = cache.is_some();
        let builder = Watchdog::builder(sync_config()).notifier(Arc::new(MockNotifier::new()));
        let watchdog = match cache {
            Some(cache) => builder.cache(cache),
            None => builder.without_cache(),
        }
        .build()
        .unwrap();

        let report = watchdog.process(null_pointer(Level::Critical)).await;
        let fp = report.outcome.fingerprint().unwrap().to_string();
        assert!(watchdog.resolve(&fp).await.unwrap());

        let report = watchdog.process(null_pointer(Level::Critical)).await;
        assert!(
            report.should_notify(),
            "critical recurrence not notified (cache tier: {})",
            with_cache
        );
        assert_eq!(
            report.decision.unwrap().decided_by.as_deref(),
            Some("SeverityRule")
        );

        watchdog.shutdown().await;
        let group = watchdog.find(&fp).await.unwrap().unwrap();
        assert!(group.is_resolved);
        assert_eq!(group.occurrence_count, 2);
    }
}

#[tokio::test]
async fn test_oversized_cache_ttl_falls_back_instead_of_panicking() {
    let mut config = sync_config();
    config.cache.ttl_seconds = 40_000_000_000;
    config.reconciliation.interval_seconds = u64::MAX;
    config.reconciliation.base_delay_ms = u64::MAX;

    let watchdog = Watchdog::builder(config)
        .notifier(Arc::new(MockNotifier::new()))
        .build()
        .unwrap();
    let report = watchdog.process(null_pointer(Level::Error)).await;
    assert!(matches!(report.outcome, TrackOutcome::Created(_)));
    watchdog.shutdown().await;
}
