use crate::aggregator::ErrorGroup;
use crate::config::NotificationConfig;
use crate::events::Timestamp;
use crate::triggers::rules::{CooldownRule, FrequencyRule, HourlyRateRule, SeverityRule};
use serde::{Deserialize, Serialize};

/// Outcome of a single rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub notify: bool,
    pub reason: String,
}

impl Verdict {
    pub fn notify(reason: impl Into<String>) -> Self {
        Self {
            notify: true,
            reason: reason.into(),
        }
    }

    pub fn suppress(reason: impl Into<String>) -> Self {
        Self {
            notify: false,
            reason: reason.into(),
        }
    }
}

/// A rule in the notification chain
pub trait NotificationRule: Send + Sync {
    /// Return a verdict, or `None` to defer to the next rule
    fn evaluate(&self, group: &ErrorGroup, now: Timestamp) -> Option<Verdict>;

    /// Get a human-readable name for this rule
    fn name(&self) -> &str;
}

/// Result of evaluating a group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub should_notify: bool,
    pub reason: String,
    /// Rule that decided, `None` when nothing matched
    pub decided_by: Option<String>,
    /// The post-update group the decision was made on
    pub group: ErrorGroup,
}

/// Ordered rule chain deciding whether a group notifies
///
/// Pure read: evaluating never mutates the group or the store.
pub struct DecisionEngine {
    rules: Vec<Box<dyn NotificationRule>>,
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::from_config(&NotificationConfig::default())
    }
}

impl DecisionEngine {
    /// Create an engine with no rules (everything is suppressed)
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Build the standard chain from notification thresholds
    ///
    /// The severity rule comes first so critical groups always notify; set
    /// `severity_bypasses_cooldown = false` to put the cooldown ahead of it.
    pub fn from_config(config: &NotificationConfig) -> Self {
        let defaults = NotificationConfig::default();
        let min_severity = if (1..=10).contains(&config.min_severity) {
            config.min_severity
        } else {
            defaults.min_severity
        };
        let frequency = if config.frequency_threshold == 0 {
            defaults.frequency_threshold
        } else {
            config.frequency_threshold
        };
        let hourly = if config.hourly_threshold == 0 {
            defaults.hourly_threshold
        } else {
            config.hourly_threshold
        };

        let mut engine = Self::new();
        if config.severity_bypasses_cooldown {
            engine.add_rule(Box::new(SeverityRule::new(min_severity)));
            engine.add_rule(Box::new(CooldownRule::new(config.cooldown_minutes)));
        } else {
            engine.add_rule(Box::new(CooldownRule::new(config.cooldown_minutes)));
            engine.add_rule(Box::new(SeverityRule::new(min_severity)));
        }
        engine.add_rule(Box::new(FrequencyRule::new(frequency)));
        engine.add_rule(Box::new(HourlyRateRule::new(hourly)));
        engine
    }

    /// Append a rule to the end of the chain
    pub fn add_rule(&mut self, rule: Box<dyn NotificationRule>) {
        self.rules.push(rule);
    }

    /// Evaluate the chain; the first rule with a verdict decides
    pub fn decide(&self, group: ErrorGroup, now: Timestamp) -> Decision {
        for rule in &self.rules {
            if let Some(verdict) = rule.evaluate(&group, now) {
                return Decision {
                    should_notify: verdict.notify,
                    reason: verdict.reason,
                    decided_by: Some(rule.name().to_string()),
                    group,
                };
            }
        }

        Decision {
            should_notify: false,
            reason: "below all notification thresholds".to_string(),
            decided_by: None,
            group,
        }
    }

    /// Names of the configured rules in evaluation order
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
