use crate::aggregator::group::{ErrorGroup, GroupQuery, NewErrorGroup, OccurrenceUpdate};
use crate::aggregator::store::{AggregationStore, StoreFuture};
use crate::error::StoreError;
use crate::events::Timestamp;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Process-local store backed by a mutex-guarded map
///
/// Every operation runs inside a single critical section, which is what makes
/// same-fingerprint updates atomic. Used for tests and when no database path
/// is configured.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    groups: Mutex<HashMap<String, ErrorGroup>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of groups currently held
    pub fn len(&self) -> usize {
        self.groups.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a group as-is
    pub fn insert_group(&self, group: ErrorGroup) -> Result<(), StoreError> {
        self.lock()?.insert(group.fingerprint.clone(), group);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ErrorGroup>>, StoreError> {
        self.groups
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }

    fn find_sync(&self, fingerprint: &str) -> Result<Option<ErrorGroup>, StoreError> {
        Ok(self.lock()?.get(fingerprint).cloned())
    }

    fn create_sync(&self, new_group: NewErrorGroup) -> Result<ErrorGroup, StoreError> {
        let mut groups = self.lock()?;
        if let Some(existing) = groups.get_mut(&new_group.fingerprint) {
            existing.apply_occurrence(&new_group.as_update());
            return Ok(existing.clone());
        }
        let group = new_group.into_group();
        groups.insert(group.fingerprint.clone(), group.clone());
        Ok(group)
    }

    fn record_sync(
        &self,
        fingerprint: &str,
        update: &OccurrenceUpdate,
    ) -> Result<Option<ErrorGroup>, StoreError> {
        let mut groups = self.lock()?;
        Ok(groups.get_mut(fingerprint).map(|group| {
            group.apply_occurrence(update);
            group.clone()
        }))
    }

    fn modify_sync<F>(&self, fingerprint: &str, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut ErrorGroup),
    {
        let mut groups = self.lock()?;
        match groups.get_mut(fingerprint) {
            Some(group) => {
                f(group);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list_sync(&self, query: &GroupQuery) -> Result<Vec<ErrorGroup>, StoreError> {
        let mut selected: Vec<ErrorGroup> = self
            .lock()?
            .values()
            .filter(|g| g.matches(query))
            .cloned()
            .collect();
        query.order_and_limit(&mut selected);
        Ok(selected)
    }

    fn delete_sync(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        let mut groups = self.lock()?;
        let before = groups.len();
        groups.retain(|_, g| !(g.is_resolved && g.resolved_at.map_or(false, |at| at < cutoff)));
        Ok((before - groups.len()) as u64)
    }
}

impl AggregationStore for InMemoryStore {
    fn find_by_fingerprint<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, Option<ErrorGroup>> {
        Box::pin(async move { self.find_sync(fingerprint) })
    }

    fn create<'a>(&'a self, group: NewErrorGroup) -> StoreFuture<'a, ErrorGroup> {
        Box::pin(async move { self.create_sync(group) })
    }

    fn record_occurrence<'a>(
        &'a self,
        fingerprint: &'a str,
        update: OccurrenceUpdate,
    ) -> StoreFuture<'a, Option<ErrorGroup>> {
        Box::pin(async move { self.record_sync(fingerprint, &update) })
    }

    fn mark_resolved<'a>(&'a self, fingerprint: &'a str, at: Timestamp) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.modify_sync(fingerprint, |group| {
                group.is_resolved = true;
                group.resolved_at = Some(at);
            })
        })
    }

    fn record_notification_sent<'a>(
        &'a self,
        fingerprint: &'a str,
        at: Timestamp,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.modify_sync(fingerprint, |group| {
                group.notification_sent = true;
                group.last_notification_at = Some(at);
            })
        })
    }

    fn list<'a>(&'a self, query: GroupQuery) -> StoreFuture<'a, Vec<ErrorGroup>> {
        Box::pin(async move { self.list_sync(&query) })
    }

    fn delete_resolved_before<'a>(&'a self, cutoff: Timestamp) -> StoreFuture<'a, u64> {
        Box::pin(async move { self.delete_sync(cutoff) })
    }
}

/// Store double for fault injection
///
/// Wraps an [`InMemoryStore`]. While failing, every call returns the configured
/// error; a configured delay is applied to every call, failing or not, which is
/// how hanging backends are simulated.
#[derive(Debug)]
pub struct FaultyStore {
    inner: InMemoryStore,
    failing: AtomicBool,
    error: StoreError,
    delay: Option<Duration>,
    call_count: AtomicUsize,
}

impl Default for FaultyStore {
    fn default() -> Self {
        Self::failing()
    }
}

impl FaultyStore {
    /// A store that fails every call with `StoreError::Unavailable`
    pub fn failing() -> Self {
        Self {
            inner: InMemoryStore::new(),
            failing: AtomicBool::new(true),
            error: StoreError::Unavailable("injected failure".to_string()),
            delay: None,
            call_count: AtomicUsize::new(0),
        }
    }

    /// A store that works until told to fail
    pub fn healthy() -> Self {
        let store = Self::failing();
        store.set_failing(false);
        store
    }

    /// Return this error while failing
    pub fn with_error(mut self, error: StoreError) -> Self {
        self.error = error;
        self
    }

    /// Sleep before answering every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of store calls made so far
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// The wrapped store, for inspecting what was written while healthy
    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    async fn gate(&self) -> Result<(), StoreError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            Err(self.error.clone())
        } else {
            Ok(())
        }
    }
}

impl AggregationStore for FaultyStore {
    fn find_by_fingerprint<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, Option<ErrorGroup>> {
        Box::pin(async move {
            self.gate().await?;
            self.inner.find_by_fingerprint(fingerprint).await
        })
    }

    fn create<'a>(&'a self, group: NewErrorGroup) -> StoreFuture<'a, ErrorGroup> {
        Box::pin(async move {
            self.gate().await?;
            self.inner.create(group).await
        })
    }

    fn record_occurrence<'a>(
        &'a self,
        fingerprint: &'a str,
        update: OccurrenceUpdate,
    ) -> StoreFuture<'a, Option<ErrorGroup>> {
        Box::pin(async move {
            self.gate().await?;
            self.inner.record_occurrence(fingerprint, update).await
        })
    }

    fn mark_resolved<'a>(&'a self, fingerprint: &'a str, at: Timestamp) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.gate().await?;
            self.inner.mark_resolved(fingerprint, at).await
        })
    }

    fn record_notification_sent<'a>(
        &'a self,
        fingerprint: &'a str,
        at: Timestamp,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.gate().await?;
            self.inner.record_notification_sent(fingerprint, at).await
        })
    }

    fn list<'a>(&'a self, query: GroupQuery) -> StoreFuture<'a, Vec<ErrorGroup>> {
        Box::pin(async move {
            self.gate().await?;
            self.inner.list(query).await
        })
    }

    fn delete_resolved_before<'a>(&'a self, cutoff: Timestamp) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.gate().await?;
            self.inner.delete_resolved_before(cutoff).await
        })
    }
}
