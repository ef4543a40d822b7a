//! Fast counter cache tier
//!
//! A per-fingerprint counter with a bounded window lets the tracker tell a
//! first-in-window occurrence (written through to the store) from a repeat
//! (deferred to reconciliation). The tier is optional; when it is absent or
//! failing the tracker goes durable-only.

pub mod local;
pub mod snapshots;

pub use local::{FaultyCache, LocalCounterCache};
pub use snapshots::GroupSnapshots;

use crate::error::CacheError;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Longest time-to-live handed to the underlying caches (one year)
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Boxed future returned by counter cache operations
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Atomic, windowed per-key counter
pub trait CounterCache: Send + Sync {
    /// Increment the counter for `key` and return the post-increment value
    ///
    /// A return value of 1 means this is the first increment in a fresh window.
    fn increment<'a>(&'a self, key: &'a str) -> CacheFuture<'a, u64>;
}

/// Cache key for a fingerprint's occurrence counter
pub fn counter_key(prefix: &str, fingerprint: &str) -> String {
    format!("{}:count:{}", prefix, fingerprint)
}
