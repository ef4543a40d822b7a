use crate::aggregator::{ErrorGroup, OccurrenceUpdate};
use crate::cache::MAX_TTL;
use crate::events::Timestamp;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use std::time::Duration;

/// Recent durable snapshots of error groups
///
/// Deferred occurrences never touch the store, so the decision engine
/// evaluates a projection instead: the last snapshot read back from the store
/// with the deferred occurrences applied in memory. Projections are written
/// back, so consecutive repeats keep accumulating until the next durable write
/// replaces the snapshot.
#[derive(Clone)]
pub struct GroupSnapshots {
    groups: Cache<String, ErrorGroup>,
}

impl GroupSnapshots {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        Self {
            groups: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl.min(MAX_TTL))
                .build(),
        }
    }

    /// Replace the snapshot with a group fresh from the store
    pub async fn remember(&self, group: &ErrorGroup) {
        self.groups
            .insert(group.fingerprint.clone(), group.clone())
            .await;
    }

    /// Apply a deferred occurrence to the snapshot and return the projection
    ///
    /// Returns `None` when no snapshot is held for the fingerprint.
    pub async fn project(&self, fingerprint: &str, update: &OccurrenceUpdate) -> Option<ErrorGroup> {
        let result = self
            .groups
            .entry(fingerprint.to_string())
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(entry) => {
                        let mut group = entry.into_value();
                        group.apply_occurrence(update);
                        Op::Put(group)
                    }
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;

        match result {
            CompResult::ReplacedWith(entry) | CompResult::Inserted(entry) => Some(entry.into_value()),
            _ => None,
        }
    }

    /// Reflect a sent notification so later projections see the cooldown
    pub async fn note_notified(&self, fingerprint: &str, at: Timestamp) {
        self.groups
            .entry(fingerprint.to_string())
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(entry) => {
                        let mut group = entry.into_value();
                        group.notification_sent = true;
                        group.last_notification_at = Some(at);
                        Op::Put(group)
                    }
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
    }

    pub async fn get(&self, fingerprint: &str) -> Option<ErrorGroup> {
        self.groups.get(fingerprint).await
    }

    /// Reflect a resolved group so later projections keep deciding on it
    pub async fn note_resolved(&self, fingerprint: &str, at: Timestamp) {
        self.groups
            .entry(fingerprint.to_string())
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(entry) => {
                        let mut group = entry.into_value();
                        group.is_resolved = true;
                        group.resolved_at = Some(at);
                        Op::Put(group)
                    }
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
    }
}

impl std::fmt::Debug for GroupSnapshots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupSnapshots")
            .field("entries", &self.groups.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::group::test_support::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_project_without_snapshot() {
        let snapshots = GroupSnapshots::new(Duration::from_secs(60), 100);
        assert!(snapshots.project("fp", &update_at(Utc::now())).await.is_none());
    }

    #[tokio::test]
    async fn test_projections_accumulate() {
        let snapshots = GroupSnapshots::new(Duration::from_secs(60), 100);
        snapshots.remember(&group_now("fp")).await;

        let first = snapshots.project("fp", &update_at(Utc::now())).await.unwrap();
        assert_eq!(first.occurrence_count, 2);
        let second = snapshots.project("fp", &update_at(Utc::now())).await.unwrap();
        assert_eq!(second.occurrence_count, 3);
        assert_eq!(second.hourly_count, 3);
    }

    #[tokio::test]
    async fn test_note_notified() {
        let snapshots = GroupSnapshots::new(Duration::from_secs(60), 100);
        snapshots.remember(&group_now("fp")).await;

        let at = Utc::now();
        snapshots.note_notified("fp", at).await;
        let group = snapshots.get("fp").await.unwrap();
        assert_eq!(group.last_notification_at, Some(at));
        assert!(group.notification_sent);
    }

    #[tokio::test]
    async fn test_resolved_snapshot_still_projects() {
        let snapshots = GroupSnapshots::new(Duration::from_secs(60), 100);
        snapshots.remember(&group_now("fp")).await;

        let at = Utc::now();
        snapshots.note_resolved("fp", at).await;
        let group = snapshots.get("fp").await.unwrap();
        assert!(group.is_resolved);
        assert_eq!(group.resolved_at, Some(at));

        let projected = snapshots.project("fp", &update_at(Utc::now())).await.unwrap();
        assert_eq!(projected.occurrence_count, 2);
        assert!(projected.is_resolved);

        // Unknown fingerprints are left alone
        snapshots.note_resolved("missing", at).await;
        assert!(snapshots.get("missing").await.is_none());
    }
}
