use crate::cache::{CacheFuture, CounterCache, MAX_TTL};
use crate::error::CacheError;
use moka::future::Cache;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    started: Instant,
}

/// In-process counter cache built on `moka`
///
/// Each key holds a counter and the instant its window opened. The window is
/// fixed: later increments never extend it, and the first increment after it
/// lapses starts a new window at 1. Entries are evicted by moka once they are
/// older than the window or when the cache is over capacity.
#[derive(Clone)]
pub struct LocalCounterCache {
    counters: Cache<String, Window>,
    ttl: Duration,
}

impl LocalCounterCache {
    /// Create a counter cache
    ///
    /// # Arguments
    ///
    /// * `ttl` - Length of each counter window
    /// * `max_entries` - Upper bound on tracked keys
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        let ttl = ttl.min(MAX_TTL);
        Self {
            counters: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl std::fmt::Debug for LocalCounterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCounterCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.counters.entry_count())
            .finish()
    }
}

impl CounterCache for LocalCounterCache {
    fn increment<'a>(&'a self, key: &'a str) -> CacheFuture<'a, u64> {
        Box::pin(async move {
            let ttl = self.ttl;
            // Upserts on one key are serialized by moka, so no increment is lost.
            let entry = self
                .counters
                .entry(key.to_string())
                .and_upsert_with(|existing| {
                    let now = Instant::now();
                    let next = match existing.map(|e| e.into_value()) {
                        Some(window) if now.duration_since(window.started) < ttl => Window {
                            count: window.count + 1,
                            started: window.started,
                        },
                        _ => Window {
                            count: 1,
                            started: now,
                        },
                    };
                    std::future::ready(next)
                })
                .await;
            Ok(entry.into_value().count)
        })
    }
}

/// Counter cache double for fault injection
#[derive(Debug)]
pub struct FaultyCache {
    inner: LocalCounterCache,
    failing: AtomicBool,
    delay: Option<Duration>,
    call_count: AtomicUsize,
}

impl FaultyCache {
    /// A cache that fails every call
    pub fn failing() -> Self {
        Self {
            inner: LocalCounterCache::new(Duration::from_secs(300), 10_000),
            failing: AtomicBool::new(true),
            delay: None,
            call_count: AtomicUsize::new(0),
        }
    }

    /// A working cache that can be switched to failing later
    pub fn healthy() -> Self {
        let cache = Self::failing();
        cache.set_failing(false);
        cache
    }

    /// Sleep before answering every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

impl CounterCache for FaultyCache {
    fn increment<'a>(&'a self, key: &'a str) -> CacheFuture<'a, u64> {
        Box::pin(async move {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(CacheError::Unavailable("injected failure".to_string()));
            }
            self.inner.increment(key).await
        })
    }
}
