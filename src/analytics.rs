//! Trend and pattern analysis over error groups
//!
//! Everything here is read-only reporting: statistics, trending detection,
//! per-group summaries and similar-error lookup. Nothing in this module feeds
//! back into the notification decision. The retention sweep lives here as well
//! since it is driven by the same operator-facing commands.

use crate::aggregator::{AggregationStore, ErrorGroup, GroupOrder, GroupQuery};
use crate::error::StoreError;
use crate::events::Timestamp;
use chrono::{Duration, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const TOP_ERRORS: usize = 10;
const TRENDING_LIMIT: usize = 10;
const HIGH_SEVERITY: u8 = 7;

/// Human-oriented digest of one group, attached to notifications
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorSummary {
    pub frequency_analysis: String,
    pub severity_indicator: String,
    pub pattern_analysis: String,
    pub impact_assessment: String,
    pub recommendations: Vec<String>,
}

impl ErrorSummary {
    pub fn for_group(group: &ErrorGroup) -> Self {
        Self {
            frequency_analysis: group.frequency_description(),
            severity_indicator: group.severity_indicator().to_string(),
            pattern_analysis: pattern(group).to_string(),
            impact_assessment: impact(group).to_string(),
            recommendations: recommendations(group),
        }
    }
}

/// A trending group with how far above its average rate it is running
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendingError {
    pub group: ErrorGroup,
    pub trend_factor: f64,
    pub description: String,
}

/// Compact row for the top-errors table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopError {
    pub fingerprint: String,
    pub classification: String,
    pub message: String,
    pub occurrence_count: u64,
    pub severity_score: u8,
}

/// Aggregate statistics over every tracked group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub unresolved_errors: u64,
    pub high_severity_errors: u64,
    /// Groups that occurred in the last 24 hours
    pub recent_errors: u64,
    pub trending_errors: u64,
    /// Unresolved groups with the highest occurrence counts
    pub top_errors: Vec<TopError>,
    /// (environment, group count), most groups first
    pub by_environment: Vec<(String, u64)>,
    /// (severity score, group count), highest score first
    pub by_severity: Vec<(u8, u64)>,
    /// (hour of day in UTC, group count) for groups seen in the last 24 hours
    pub hourly_trend: Vec<(u32, u64)>,
}

/// Whether the last hour is running above the group's lifetime hourly share
pub fn is_trending(group: &ErrorGroup) -> bool {
    group.hourly_count as f64 > group.occurrence_count as f64 / 24.0
}

/// Lifetime average occurrences per hour, with at least one hour elapsed
pub fn average_hourly_rate(group: &ErrorGroup, now: Timestamp) -> f64 {
    let hours = (now - group.first_occurred_at).num_hours().max(1);
    group.occurrence_count as f64 / hours as f64
}

/// Ratio of the current hourly count to the lifetime average
pub fn trend_factor(group: &ErrorGroup, now: Timestamp) -> f64 {
    group.hourly_count as f64 / average_hourly_rate(group, now).max(1.0)
}

pub fn trend_description(group: &ErrorGroup, now: Timestamp) -> &'static str {
    let hourly = group.hourly_count as f64;
    let average = average_hourly_rate(group, now);

    if hourly > average * 3.0 {
        "Rapidly increasing"
    } else if hourly > average * 2.0 {
        "Increasing"
    } else {
        "Stable frequency"
    }
}

pub fn pattern(group: &ErrorGroup) -> &'static str {
    if group.hourly_count >= 10 {
        "High frequency - occurring multiple times per hour"
    } else if group.daily_count >= 20 {
        "Frequent - multiple occurrences today"
    } else if group.occurrence_count >= 50 {
        "Persistent - recurring over time"
    } else {
        "Sporadic - infrequent occurrences"
    }
}

pub fn impact(group: &ErrorGroup) -> &'static str {
    match group.severity_score {
        s if s >= 9 => "Critical - immediate attention required",
        s if s >= 7 => "High - should be addressed soon",
        s if s >= 5 => "Medium - monitor and plan fix",
        _ => "Low - can be addressed in regular maintenance",
    }
}

pub fn recommendations(group: &ErrorGroup) -> Vec<String> {
    let mut recs = Vec::new();

    if group.occurrence_count >= 10 {
        recs.push("Consider implementing error prevention measures".to_string());
    }
    if group.hourly_count >= 5 {
        recs.push("Investigate root cause - high frequency detected".to_string());
    }
    if group.severity_score >= 8 {
        recs.push("Escalate to development team immediately".to_string());
    }
    if recs.is_empty() {
        recs.push("Monitor for pattern changes".to_string());
    }

    recs
}

/// Compute statistics over a set of groups
pub fn statistics(groups: &[ErrorGroup], now: Timestamp) -> ErrorStatistics {
    let day_ago = now - Duration::hours(24);
    let mut stats = ErrorStatistics {
        total_errors: groups.len() as u64,
        ..Default::default()
    };

    let mut by_environment: HashMap<&str, u64> = HashMap::new();
    let mut by_severity: HashMap<u8, u64> = HashMap::new();
    let mut by_hour: HashMap<u32, u64> = HashMap::new();

    for group in groups {
        if !group.is_resolved {
            stats.unresolved_errors += 1;
        }
        if group.severity_score >= HIGH_SEVERITY {
            stats.high_severity_errors += 1;
        }
        if group.last_occurred_at >= day_ago {
            stats.recent_errors += 1;
            *by_hour.entry(group.last_occurred_at.hour()).or_insert(0) += 1;
        }
        if is_trending(group) {
            stats.trending_errors += 1;
        }
        *by_environment.entry(group.environment.as_str()).or_insert(0) += 1;
        *by_severity.entry(group.severity_score).or_insert(0) += 1;
    }

    let mut top: Vec<&ErrorGroup> = groups.iter().filter(|g| !g.is_resolved).collect();
    top.sort_by(|a, b| b.occurrence_count.cmp(&a.occurrence_count));
    stats.top_errors = top
        .into_iter()
        .take(TOP_ERRORS)
        .map(|g| TopError {
            fingerprint: g.fingerprint.clone(),
            classification: g.classification.clone(),
            message: g.message.clone(),
            occurrence_count: g.occurrence_count,
            severity_score: g.severity_score,
        })
        .collect();

    stats.by_environment = by_environment
        .into_iter()
        .map(|(env, count)| (env.to_string(), count))
        .collect();
    stats
        .by_environment
        .sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    stats.by_severity = by_severity.into_iter().collect();
    stats.by_severity.sort_by(|a, b| b.0.cmp(&a.0));

    stats.hourly_trend = by_hour.into_iter().collect();
    stats.hourly_trend.sort_by_key(|(hour, _)| *hour);

    stats
}

/// Groups that look like variations of `target`
///
/// Candidates must share classification and environment and have a different
/// fingerprint. When the first three words of the target message contain words
/// longer than three bytes, the candidate message must contain one of them
/// (case-insensitive). Results are ordered by occurrence count, highest first.
pub fn similar_errors(target: &ErrorGroup, candidates: &[ErrorGroup], limit: usize) -> Vec<ErrorGroup> {
    let keywords: Vec<String> = target
        .message
        .split(' ')
        .take(3)
        .filter(|w| w.len() > 3)
        .map(|w| w.to_lowercase())
        .collect();

    let mut similar: Vec<ErrorGroup> = candidates
        .iter()
        .filter(|c| {
            c.fingerprint != target.fingerprint
                && c.classification == target.classification
                && c.environment == target.environment
        })
        .filter(|c| {
            if keywords.is_empty() {
                return true;
            }
            let message = c.message.to_lowercase();
            keywords.iter().any(|k| message.contains(k.as_str()))
        })
        .cloned()
        .collect();

    similar.sort_by(|a, b| b.occurrence_count.cmp(&a.occurrence_count));
    similar.truncate(limit);
    similar
}

/// Load every group from the store and compute statistics
pub async fn collect_statistics(
    store: &dyn AggregationStore,
    now: Timestamp,
) -> Result<ErrorStatistics, StoreError> {
    let groups = store.list(GroupQuery::default()).await?;
    Ok(statistics(&groups, now))
}

/// Find groups similar to the one with `fingerprint`
pub async fn find_similar(
    store: &dyn AggregationStore,
    fingerprint: &str,
    limit: usize,
) -> Result<Vec<ErrorGroup>, StoreError> {
    let Some(target) = store.find_by_fingerprint(fingerprint).await? else {
        return Ok(Vec::new());
    };
    let candidates = store
        .list(GroupQuery {
            environment: Some(target.environment.clone()),
            ..Default::default()
        })
        .await?;
    Ok(similar_errors(&target, &candidates, limit))
}

/// Unresolved trending groups, busiest hour first
pub async fn trending_analysis(
    store: &dyn AggregationStore,
    now: Timestamp,
) -> Result<Vec<TrendingError>, StoreError> {
    let groups = store
        .list(GroupQuery {
            unresolved_only: true,
            order: GroupOrder::HourlyCount,
            ..Default::default()
        })
        .await?;

    Ok(groups
        .into_iter()
        .filter(is_trending)
        .take(TRENDING_LIMIT)
        .map(|group| TrendingError {
            trend_factor: trend_factor(&group, now),
            description: trend_description(&group, now).to_string(),
            group,
        })
        .collect())
}

/// Delete resolved groups resolved more than `days_to_keep` days before `now`
pub async fn cleanup(
    store: &dyn AggregationStore,
    days_to_keep: u32,
    now: Timestamp,
) -> Result<u64, StoreError> {
    let cutoff = now - Duration::days(i64::from(days_to_keep));
    store.delete_resolved_before(cutoff).await
}
