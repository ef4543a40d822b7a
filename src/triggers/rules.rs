//! Notification rule implementations
//!
//! Each rule looks at a post-update error group and either returns a verdict or
//! passes. The decision engine runs them in order and the first verdict wins.

use crate::aggregator::ErrorGroup;
use crate::events::Timestamp;
use crate::triggers::decision_engine::{NotificationRule, Verdict};
use chrono::Duration;

/// Notifies when the severity score reaches a minimum
pub struct SeverityRule {
    min_severity: u8,
}

impl SeverityRule {
    pub fn new(min_severity: u8) -> Self {
        Self { min_severity }
    }
}

impl NotificationRule for SeverityRule {
    fn evaluate(&self, group: &ErrorGroup, _now: Timestamp) -> Option<Verdict> {
        (group.severity_score >= self.min_severity).then(|| {
            Verdict::notify(format!(
                "severity {} >= {}",
                group.severity_score, self.min_severity
            ))
        })
    }

    fn name(&self) -> &str {
        "SeverityRule"
    }
}

/// Suppresses a group notified less than `cooldown` ago
pub struct CooldownRule {
    cooldown: Duration,
}

impl CooldownRule {
    /// Create a cooldown rule
    ///
    /// # Arguments
    ///
    /// * `cooldown_minutes` - Minimum minutes between two notifications for a group
    pub fn new(cooldown_minutes: u64) -> Self {
        let minutes = i64::try_from(cooldown_minutes)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 60_000);
        Self {
            cooldown: Duration::minutes(minutes),
        }
    }
}

impl NotificationRule for CooldownRule {
    fn evaluate(&self, group: &ErrorGroup, now: Timestamp) -> Option<Verdict> {
        let last = group.last_notification_at?;
        match last.checked_add_signed(self.cooldown) {
            Some(until) if now < until => Some(Verdict::suppress(format!(
                "cooldown active until {}",
                until.to_rfc3339()
            ))),
            Some(_) => None,
            None => Some(Verdict::suppress("cooldown active")),
        }
    }

    fn name(&self) -> &str {
        "CooldownRule"
    }
}

/// Notifies once the lifetime occurrence count reaches a threshold
pub struct FrequencyRule {
    threshold: u64,
}

impl FrequencyRule {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }
}

impl NotificationRule for FrequencyRule {
    fn evaluate(&self, group: &ErrorGroup, _now: Timestamp) -> Option<Verdict> {
        (group.occurrence_count >= self.threshold).then(|| {
            Verdict::notify(format!(
                "occurrence count {} >= {}",
                group.occurrence_count, self.threshold
            ))
        })
    }

    fn name(&self) -> &str {
        "FrequencyRule"
    }
}

/// Notifies when the hourly count reaches a threshold
pub struct HourlyRateRule {
    threshold: u64,
}

impl HourlyRateRule {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }
}

impl NotificationRule for HourlyRateRule {
    fn evaluate(&self, group: &ErrorGroup, _now: Timestamp) -> Option<Verdict> {
        (group.hourly_count >= self.threshold).then(|| {
            Verdict::notify(format!(
                "hourly count {} >= {}",
                group.hourly_count, self.threshold
            ))
        })
    }

    fn name(&self) -> &str {
        "HourlyRateRule"
    }
}
