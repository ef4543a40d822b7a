use crate::events::Timestamp;
use chrono::Utc;
use log::warn;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Fixed-window limiter on notification volume per category
///
/// Counters are keyed by `(category, bucket)` where the bucket is the number of
/// whole windows since the Unix epoch. Check and increment happen under one
/// lock, so concurrent callers can never push a bucket past `max`.
#[derive(Debug)]
pub struct RateLimiter {
    /// Notifications allowed per category per window
    max: u64,
    window_minutes: i64,
    buckets: Mutex<HashMap<(String, i64), u64>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(10, 10)
    }
}

impl RateLimiter {
    /// Create a new rate limiter
    ///
    /// # Arguments
    ///
    /// * `max` - Maximum notifications per category per window
    /// * `window_minutes` - Window length in minutes (at least 1)
    pub fn new(max: u64, window_minutes: u64) -> Self {
        Self {
            max,
            window_minutes: i64::try_from(window_minutes).unwrap_or(i64::MAX).max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take one slot for `category` in the current window
    ///
    /// # Returns
    ///
    /// `true` if the notification may be sent, `false` if the window is full
    pub fn try_acquire(&self, category: &str) -> bool {
        self.try_acquire_at(category, Utc::now())
    }

    /// Try to take one slot for `category` in the window containing `at`
    pub fn try_acquire_at(&self, category: &str, at: Timestamp) -> bool {
        let bucket = self.bucket_for(at);
        let mut buckets = self.lock();
        buckets.retain(|(_, b), _| *b >= bucket);

        let count = buckets.entry((category.to_string(), bucket)).or_insert(0);
        if *count >= self.max {
            return false;
        }
        *count += 1;
        true
    }

    /// Slots already taken for `category` in the current window
    pub fn current_count(&self, category: &str) -> u64 {
        self.current_count_at(category, Utc::now())
    }

    pub fn current_count_at(&self, category: &str, at: Timestamp) -> u64 {
        let bucket = self.bucket_for(at);
        self.lock()
            .get(&(category.to_string(), bucket))
            .copied()
            .unwrap_or(0)
    }

    fn bucket_for(&self, at: Timestamp) -> i64 {
        at.timestamp().div_euclid(60).div_euclid(self.window_minutes)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, i64), u64>> {
        self.buckets.lock().unwrap_or_else(|poisoned| {
            warn!(target: "errwatch::internal", "Rate limiter lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn window_start() -> Timestamp {
        // 2024-01-01T00:00:00Z is aligned to every window length used below
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_rate_limiter_boundary() {
        let limiter = RateLimiter::new(2, 10);
        let now = window_start();

        assert!(limiter.try_acquire_at("exception", now));
        assert!(limiter.try_acquire_at("exception", now));
        assert!(!limiter.try_acquire_at("exception", now));

        // The counter is not advanced past the cap
        assert_eq!(limiter.current_count_at("exception", now), 2);
    }

    #[test]
    fn test_categories_are_independent() {
        let limiter = RateLimiter::new(1, 10);
        let now = window_start();

        assert!(limiter.try_acquire_at("exception", now));
        assert!(limiter.try_acquire_at("log", now));
        assert!(!limiter.try_acquire_at("exception", now));
        assert!(!limiter.try_acquire_at("log", now));
    }

    #[test]
    fn test_next_window_resets() {
        let limiter = RateLimiter::new(1, 10);
        let start = window_start();

        assert!(limiter.try_acquire_at("exception", start));
        assert!(!limiter.try_acquire_at("exception", start + Duration::minutes(9)));
        assert!(limiter.try_acquire_at("exception", start + Duration::minutes(10)));
    }

    #[test]
    fn test_stale_buckets_are_pruned() {
        let limiter = RateLimiter::new(5, 1);
        let start = window_start();

        for i in 0..10 {
            limiter.try_acquire_at("exception", start + Duration::minutes(i));
        }
        assert_eq!(limiter.lock().len(), 1);
    }

    #[test]
    fn test_zero_window_is_treated_as_one_minute() {
        let limiter = RateLimiter::new(1, 0);
        let start = window_start();

        assert!(limiter.try_acquire_at("log", start));
        assert!(limiter.try_acquire_at("log", start + Duration::minutes(1)));
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_max() {
        let limiter = Arc::new(RateLimiter::new(5, 60));
        let now = window_start();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.try_acquire_at("exception", now))
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 5);
        assert_eq!(limiter.current_count_at("exception", now), 5);
    }
}
