//! The ErrorGroup aggregation unit and the value types used to mutate it

use crate::events::{
    Context, Event, EventKind, ExceptionKind, Level, RequestMeta, StackFrame, Timestamp,
};
use crate::severity;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Aggregated record for every occurrence sharing one fingerprint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorGroup {
    /// Stable identity derived from the event's identity fields
    pub fingerprint: String,
    /// Exception class name, or `"Log"` for log events
    pub classification: String,
    pub exception_kind: ExceptionKind,
    pub message: String,
    pub source_file: Option<String>,
    pub source_line: Option<u32>,
    pub environment: String,
    /// Level of the most recent occurrence
    pub level: Level,
    /// 1-10 urgency rating, recomputed on every occurrence
    pub severity_score: u8,
    /// Context merged across occurrences, newer values win
    pub context: Context,
    pub stack_frames: Vec<StackFrame>,
    /// Most recent request metadata seen for this group
    pub request: RequestMeta,
    pub first_occurred_at: Timestamp,
    pub last_occurred_at: Timestamp,
    /// Lifetime occurrence counter
    pub occurrence_count: u64,
    /// Occurrences since the last gap longer than one hour
    pub hourly_count: u64,
    /// Occurrences since the last gap longer than 24 hours
    pub daily_count: u64,
    pub is_resolved: bool,
    pub resolved_at: Option<Timestamp>,
    pub notification_sent: bool,
    pub last_notification_at: Option<Timestamp>,
}

/// Everything needed to create a group from its first occurrence
#[derive(Debug, Clone, PartialEq)]
pub struct NewErrorGroup {
    pub fingerprint: String,
    pub classification: String,
    pub exception_kind: ExceptionKind,
    pub message: String,
    pub source_file: Option<String>,
    pub source_line: Option<u32>,
    pub environment: String,
    pub level: Level,
    pub context: Context,
    pub stack_frames: Vec<StackFrame>,
    pub request: Option<RequestMeta>,
    pub at: Timestamp,
    /// Applied when a concurrent writer already created the group
    pub reopen_resolved: bool,
}

/// A batch of `count` occurrences to apply to an existing group
#[derive(Debug, Clone, PartialEq)]
pub struct OccurrenceUpdate {
    pub count: u64,
    pub level: Level,
    pub context: Context,
    pub request: Option<RequestMeta>,
    pub stack_frames: Vec<StackFrame>,
    /// Time of the latest occurrence in the batch
    pub at: Timestamp,
    /// Clear the resolved flag when the group occurs again
    pub reopen_resolved: bool,
}

/// Sort order for group listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupOrder {
    #[default]
    LastOccurred,
    OccurrenceCount,
    HourlyCount,
}

/// Filter for listing groups out of a store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupQuery {
    pub environment: Option<String>,
    pub unresolved_only: bool,
    pub min_severity: Option<u8>,
    pub min_occurrences: Option<u64>,
    /// Only groups whose last occurrence is at or after this time
    pub since: Option<Timestamp>,
    pub order: GroupOrder,
    pub limit: Option<usize>,
}

impl NewErrorGroup {
    /// Build a creation template from a normalized event
    pub fn from_event(event: &Event, fingerprint: &str, at: Timestamp, reopen_resolved: bool) -> Self {
        let (source_file, source_line, stack_frames) = match &event.kind {
            EventKind::Exception {
                file,
                line,
                stack_frames,
                ..
            } => (file.clone(), *line, stack_frames.clone()),
            EventKind::Log => (None, None, Vec::new()),
        };

        Self {
            fingerprint: fingerprint.to_string(),
            classification: event.classification().to_string(),
            exception_kind: event.exception_kind(),
            message: event.message.clone(),
            source_file,
            source_line,
            environment: event.environment.clone(),
            level: event.level,
            context: event.context.clone(),
            stack_frames,
            request: event.request.clone(),
            at,
            reopen_resolved,
        }
    }

    /// Materialize the group as it looks right after its first occurrence
    pub fn into_group(self) -> ErrorGroup {
        ErrorGroup {
            severity_score: severity::score(self.level, self.exception_kind, 1),
            fingerprint: self.fingerprint,
            classification: self.classification,
            exception_kind: self.exception_kind,
            message: self.message,
            source_file: self.source_file,
            source_line: self.source_line,
            environment: self.environment,
            level: self.level,
            context: self.context,
            stack_frames: self.stack_frames,
            request: self.request.unwrap_or_default(),
            first_occurred_at: self.at,
            last_occurred_at: self.at,
            occurrence_count: 1,
            hourly_count: 1,
            daily_count: 1,
            is_resolved: false,
            resolved_at: None,
            notification_sent: false,
            last_notification_at: None,
        }
    }

    /// The same occurrence expressed as an update to an existing group
    pub fn as_update(&self) -> OccurrenceUpdate {
        OccurrenceUpdate {
            count: 1,
            level: self.level,
            context: self.context.clone(),
            request: self.request.clone(),
            stack_frames: self.stack_frames.clone(),
            at: self.at,
            reopen_resolved: self.reopen_resolved,
        }
    }
}

impl OccurrenceUpdate {
    /// A single occurrence taken from a normalized event
    pub fn from_event(event: &Event, at: Timestamp, reopen_resolved: bool) -> Self {
        let stack_frames = match &event.kind {
            EventKind::Exception { stack_frames, .. } => stack_frames.clone(),
            EventKind::Log => Vec::new(),
        };

        Self {
            count: 1,
            level: event.level,
            context: event.context.clone(),
            request: event.request.clone(),
            stack_frames,
            at,
            reopen_resolved,
        }
    }

    /// Fold a later batch into this one
    ///
    /// Counts add up, the latest level and timestamp win, contexts merge with
    /// the later values taking precedence.
    pub fn absorb(&mut self, later: OccurrenceUpdate) {
        self.count += later.count;
        if later.at >= self.at {
            self.at = later.at;
            self.level = later.level;
        }
        self.context.extend(later.context);
        if let Some(request) = later.request {
            match self.request.as_mut() {
                Some(existing) => existing.overlay(&request),
                None => self.request = Some(request),
            }
        }
        if self.stack_frames.is_empty() {
            self.stack_frames = later.stack_frames;
        }
        self.reopen_resolved |= later.reopen_resolved;
    }
}

/// Next value of a rolling counter after `n` occurrences at `gap` since the last one
///
/// The counter restarts at `n` only when the gap strictly exceeds the window.
pub fn rolled_count(current: u64, n: u64, gap: Duration, window: Duration) -> u64 {
    if gap > window {
        n
    } else {
        current + n
    }
}

impl ErrorGroup {
    /// Apply a batch of occurrences in memory
    ///
    /// Mirrors the atomic update the durable stores perform, so projections and
    /// the in-memory backend agree with SQLite.
    pub fn apply_occurrence(&mut self, update: &OccurrenceUpdate) {
        let n = update.count;
        let gap = update.at - self.last_occurred_at;

        self.hourly_count = rolled_count(self.hourly_count, n, gap, Duration::hours(1));
        self.daily_count = rolled_count(self.daily_count, n, gap, Duration::hours(24));
        self.occurrence_count += n;
        if update.at > self.last_occurred_at {
            self.last_occurred_at = update.at;
        }

        self.level = update.level;
        self.context
            .extend(update.context.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(request) = &update.request {
            self.request.overlay(request);
        }
        if self.stack_frames.is_empty() && !update.stack_frames.is_empty() {
            self.stack_frames = update.stack_frames.clone();
        }

        if update.reopen_resolved && self.is_resolved {
            self.is_resolved = false;
            self.resolved_at = None;
        }

        self.severity_score = severity::score(self.level, self.exception_kind, self.occurrence_count);
    }

    /// Human-readable summary of how often the group occurs
    pub fn frequency_description(&self) -> String {
        if self.occurrence_count == 1 {
            return "First occurrence".to_string();
        }

        let mut parts = Vec::new();
        if self.hourly_count > 1 {
            parts.push(format!("{}x in last hour", self.hourly_count));
        }
        if self.daily_count > self.hourly_count {
            parts.push(format!("{}x in last 24h", self.daily_count));
        }
        if self.occurrence_count > self.daily_count {
            parts.push(format!("{}x total", self.occurrence_count));
        }

        if parts.is_empty() {
            format!("{}x total", self.occurrence_count)
        } else {
            parts.join(", ")
        }
    }

    /// Textual severity tier
    pub fn severity_indicator(&self) -> &'static str {
        match self.severity_score {
            s if s >= 9 => "critical",
            s if s >= 7 => "high",
            s if s >= 5 => "medium",
            s if s >= 3 => "low",
            _ => "info",
        }
    }

    /// Whether `query` selects this group (ignores order and limit)
    pub fn matches(&self, query: &GroupQuery) -> bool {
        if let Some(env) = &query.environment {
            if &self.environment != env {
                return false;
            }
        }
        if query.unresolved_only && self.is_resolved {
            return false;
        }
        if let Some(min) = query.min_severity {
            if self.severity_score < min {
                return false;
            }
        }
        if let Some(min) = query.min_occurrences {
            if self.occurrence_count < min {
                return false;
            }
        }
        if let Some(since) = query.since {
            if self.last_occurred_at < since {
                return false;
            }
        }
        true
    }
}

impl GroupQuery {
    /// Sort and truncate an already-filtered list according to this query
    pub fn order_and_limit(&self, groups: &mut Vec<ErrorGroup>) {
        match self.order {
            GroupOrder::LastOccurred => {
                groups.sort_by(|a, b| b.last_occurred_at.cmp(&a.last_occurred_at))
            }
            GroupOrder::OccurrenceCount => groups.sort_by(|a, b| {
                b.occurrence_count
                    .cmp(&a.occurrence_count)
                    .then(b.last_occurred_at.cmp(&a.last_occurred_at))
            }),
            GroupOrder::HourlyCount => groups.sort_by(|a, b| {
                b.hourly_count
                    .cmp(&a.hourly_count)
                    .then(b.last_occurred_at.cmp(&a.last_occurred_at))
            }),
        }
        if let Some(limit) = self.limit {
            groups.truncate(limit);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Utc;

    pub fn new_group(fingerprint: &str, level: Level, at: Timestamp) -> NewErrorGroup {
        NewErrorGroup {
            fingerprint: fingerprint.to_string(),
            classification: "NullPointer".to_string(),
            exception_kind: ExceptionKind::Other,
            message: "x is undefined".to_string(),
            source_file: Some("src/app.rs".to_string()),
            source_line: Some(42),
            environment: "production".to_string(),
            level,
            context: Context::new(),
            stack_frames: Vec::new(),
            request: None,
            at,
            reopen_resolved: false,
        }
    }

    pub fn update_at(at: Timestamp) -> OccurrenceUpdate {
        OccurrenceUpdate {
            count: 1,
            level: Level::Error,
            context: Context::new(),
            request: None,
            stack_frames: Vec::new(),
            at,
            reopen_resolved: false,
        }
    }

    pub fn group_now(fingerprint: &str) -> ErrorGroup {
        new_group(fingerprint, Level::Error, Utc::now()).into_group()
    }
}
