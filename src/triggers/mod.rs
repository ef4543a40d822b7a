/// Notification decision engine and rule implementations
pub mod decision_engine;
pub mod rules;

pub use decision_engine::{Decision, DecisionEngine, NotificationRule, Verdict};
pub use rules::{CooldownRule, FrequencyRule, HourlyRateRule, SeverityRule};
