//! Reconciliation of deferred and failed durable writes
//!
//! Repeat occurrences counted by the fast cache tier, and occurrences whose
//! durable write failed, are parked here per fingerprint until they can be
//! written. Entries that keep failing back off exponentially and are dropped
//! after a bounded number of attempts. Until then the durable count lags the
//! real one.

use crate::aggregator::{with_timeout, AggregationStore, ErrorGroup, NewErrorGroup, OccurrenceUpdate};
use crate::config::ReconciliationConfig;
use crate::error::StoreError;
use log::warn;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Upper bound on a single retry delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Occurrences for one fingerprint that still have to reach the store
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOccurrence {
    /// First occurrence, used to create the group if the store has never seen it
    pub template: NewErrorGroup,
    /// Every pending occurrence folded into one batch
    pub update: OccurrenceUpdate,
    /// Failed flush attempts so far
    pub attempts: u32,
    pub next_retry: Instant,
    pub first_pending: Instant,
}

impl PendingOccurrence {
    pub fn new(template: NewErrorGroup, update: OccurrenceUpdate) -> Self {
        let now = Instant::now();
        Self {
            template,
            update,
            attempts: 0,
            next_retry: now,
            first_pending: now,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.template.fingerprint
    }

    /// Fold a newer entry for the same fingerprint into this one
    ///
    /// The older template and retry state are kept.
    pub fn absorb(&mut self, newer: PendingOccurrence) {
        self.update.absorb(newer.update);
    }
}

/// Retry policy for pending occurrences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_pending: usize,
}

impl RetryPolicy {
    pub fn from_config(config: &ReconciliationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_pending: config.max_pending.max(1),
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at [`MAX_BACKOFF`]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Instant at which retry number `attempt` becomes due
    pub fn retry_at(&self, now: Instant, attempt: u32) -> Instant {
        now.checked_add(self.backoff(attempt))
            .or_else(|| now.checked_add(MAX_BACKOFF))
            .unwrap_or(now)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ReconciliationConfig::default())
    }
}

/// Bounded per-fingerprint queue of pending occurrences
#[derive(Debug)]
pub struct ReconciliationQueue {
    pending: Mutex<HashMap<String, PendingOccurrence>>,
    policy: RetryPolicy,
}

impl ReconciliationQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Park an occurrence batch
    ///
    /// Batches for a fingerprint already in the queue are merged. When the
    /// queue is full, the entry pending the longest is evicted and returned so
    /// the caller can try it once before it is lost.
    pub fn enqueue(&self, entry: PendingOccurrence) -> Option<PendingOccurrence> {
        let mut pending = self.lock();

        if let Some(existing) = pending.get_mut(entry.fingerprint()) {
            existing.absorb(entry);
            return None;
        }

        let evicted = if pending.len() >= self.policy.max_pending {
            let oldest = pending
                .iter()
                .min_by_key(|(_, p)| p.first_pending)
                .map(|(fp, _)| fp.clone());
            oldest.and_then(|fp| pending.remove(&fp))
        } else {
            None
        };

        pending.insert(entry.fingerprint().to_string(), entry);
        evicted
    }

    /// Remove and return the pending batch for a fingerprint
    pub fn take(&self, fingerprint: &str) -> Option<PendingOccurrence> {
        self.lock().remove(fingerprint)
    }

    /// Remove and return every entry whose retry time has come
    pub fn take_due(&self, now: Instant) -> Vec<PendingOccurrence> {
        let mut pending = self.lock();
        let due: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.next_retry <= now)
            .map(|(fp, _)| fp.clone())
            .collect();
        due.into_iter().filter_map(|fp| pending.remove(&fp)).collect()
    }

    /// Remove and return every entry regardless of backoff
    pub fn take_all(&self) -> Vec<PendingOccurrence> {
        self.lock().drain().map(|(_, p)| p).collect()
    }

    /// Put back an entry whose flush failed
    ///
    /// # Returns
    ///
    /// `false` if the entry ran out of attempts and was dropped
    pub fn requeue(&self, mut entry: PendingOccurrence) -> bool {
        entry.attempts += 1;
        if entry.attempts >= self.policy.max_attempts {
            return false;
        }
        entry.next_retry = self.policy.retry_at(Instant::now(), entry.attempts);

        let mut pending = self.lock();
        let fingerprint = entry.fingerprint().to_string();
        // Occurrences queued while the flush was in flight are newer
        if let Some(newer) = pending.remove(&fingerprint) {
            entry.absorb(newer);
        }
        pending.insert(fingerprint, entry);
        true
    }

    /// Pending occurrence count for a fingerprint
    pub fn pending_count(&self, fingerprint: &str) -> u64 {
        self.lock()
            .get(fingerprint)
            .map_or(0, |p| p.update.count)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingOccurrence>> {
        self.pending.lock().unwrap_or_else(|poisoned| {
            warn!(target: "errwatch::internal", "Reconciliation queue lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Result of a successful durable write
#[derive(Debug, Clone, PartialEq)]
pub enum Persisted {
    Created(ErrorGroup),
    Updated(ErrorGroup),
}

impl Persisted {
    pub fn group(&self) -> &ErrorGroup {
        match self {
            Persisted::Created(group) | Persisted::Updated(group) => group,
        }
    }

    pub fn into_group(self) -> ErrorGroup {
        match self {
            Persisted::Created(group) | Persisted::Updated(group) => group,
        }
    }
}

/// Write an occurrence batch to the store, creating the group when unknown
///
/// A group is created from `template` with the first occurrence and the rest
/// of the batch is recorded on it. On error, `update.count` holds what still
/// has to be written, so the caller can requeue without double counting.
///
/// # Errors
///
/// Returns the first `StoreError` encountered, including `StoreError::Timeout`
/// when a call exceeds `timeout`.
pub async fn persist(
    store: &dyn AggregationStore,
    template: &NewErrorGroup,
    update: &mut OccurrenceUpdate,
    timeout: Duration,
) -> Result<Persisted, StoreError> {
    let fingerprint = template.fingerprint.as_str();

    if let Some(group) =
        with_timeout(timeout, store.record_occurrence(fingerprint, update.clone())).await?
    {
        return Ok(Persisted::Updated(group));
    }

    let created = with_timeout(timeout, store.create(template.clone())).await?;
    let was_new = created.occurrence_count == 1;
    if update.count <= 1 {
        return Ok(if was_new {
            Persisted::Created(created)
        } else {
            Persisted::Updated(created)
        });
    }

    update.count -= 1;
    let group = with_timeout(timeout, store.record_occurrence(fingerprint, update.clone()))
        .await?
        .unwrap_or(created);
    Ok(if was_new {
        Persisted::Created(group)
    } else {
        Persisted::Updated(group)
    })
}
