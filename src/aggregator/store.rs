use crate::aggregator::group::{ErrorGroup, GroupQuery, NewErrorGroup, OccurrenceUpdate};
use crate::error::StoreError;
use crate::events::Timestamp;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by every store operation
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Durable persistence for error groups
///
/// Implementations must make `record_occurrence` atomic per fingerprint: two
/// concurrent calls for the same group never lose an increment. `create` is
/// first-writer-creates: when the fingerprint already exists the call records
/// one occurrence on the existing group instead of failing.
pub trait AggregationStore: Send + Sync {
    /// Look up a group without side effects
    fn find_by_fingerprint<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, Option<ErrorGroup>>;

    /// Insert a group for its first occurrence, or upsert onto an existing one
    fn create<'a>(&'a self, group: NewErrorGroup) -> StoreFuture<'a, ErrorGroup>;

    /// Apply a batch of occurrences atomically
    ///
    /// # Returns
    ///
    /// The post-update group, or `None` if the fingerprint is unknown
    fn record_occurrence<'a>(
        &'a self,
        fingerprint: &'a str,
        update: OccurrenceUpdate,
    ) -> StoreFuture<'a, Option<ErrorGroup>>;

    /// Flag a group as resolved; returns `false` for unknown fingerprints
    fn mark_resolved<'a>(&'a self, fingerprint: &'a str, at: Timestamp) -> StoreFuture<'a, bool>;

    /// Record that a notification was initiated for a group
    fn record_notification_sent<'a>(
        &'a self,
        fingerprint: &'a str,
        at: Timestamp,
    ) -> StoreFuture<'a, bool>;

    /// List groups matching a query
    fn list<'a>(&'a self, query: GroupQuery) -> StoreFuture<'a, Vec<ErrorGroup>>;

    /// Delete resolved groups whose `resolved_at` is older than `cutoff`
    fn delete_resolved_before<'a>(&'a self, cutoff: Timestamp) -> StoreFuture<'a, u64>;
}

/// Run a store operation under a deadline, mapping expiry to `StoreError::Timeout`
pub async fn with_timeout<T>(
    timeout: std::time::Duration,
    operation: StoreFuture<'_, T>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}
