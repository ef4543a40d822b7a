use crate::alerts::notifier::{Notification, NotificationCategory, Notifier};
use crate::alerts::RateLimiter;
use crate::config::{Config, RateLimitConfig};
use crate::error::NotifyError;
use crate::triggers::Decision;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// What happened to a decision at the notification gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertOutcome {
    /// The notifier accepted the notification
    Sent,
    /// The decision engine said not to notify
    Suppressed,
    /// The category's rate window is full
    RateLimited,
    /// The notifier failed or timed out
    Failed(String),
}

/// Gate between decisions and the outbound notifier
///
/// The AlertManager applies the global rate limit after the per-group
/// decision and hands the notification to the notifier under a timeout.
/// Notifier failures are reported as an outcome and never propagate.
pub struct AlertManager {
    notifier: Arc<dyn Notifier>,
    /// `None` when rate limiting is disabled
    rate_limiter: Option<RateLimiter>,
    timeout: Duration,
}

impl AlertManager {
    /// Create an alert manager
    ///
    /// # Arguments
    ///
    /// * `notifier` - Transport that receives approved notifications
    /// * `rate_limiter` - Volume limit, or `None` to send every approved decision
    /// * `timeout` - Upper bound for a single notifier call
    pub fn new(notifier: Arc<dyn Notifier>, rate_limiter: Option<RateLimiter>, timeout: Duration) -> Self {
        Self {
            notifier,
            rate_limiter,
            timeout,
        }
    }

    /// Build from the rate limit and timeout sections of a configuration
    pub fn from_config(notifier: Arc<dyn Notifier>, config: &Config) -> Self {
        Self::new(
            notifier,
            rate_limiter_from(&config.rate_limit),
            config.operation_timeout(),
        )
    }

    /// Send a notification for an approved decision
    ///
    /// # Returns
    ///
    /// The gate outcome; only `AlertOutcome::Sent` means the notifier accepted it
    pub async fn dispatch(&self, decision: &Decision) -> AlertOutcome {
        if !decision.should_notify {
            debug!(
                "Suppressed notification for {}: {}",
                decision.group.fingerprint, decision.reason
            );
            return AlertOutcome::Suppressed;
        }

        let category = NotificationCategory::for_group(&decision.group);
        if let Some(ref limiter) = self.rate_limiter {
            if !limiter.try_acquire(category.as_str()) {
                info!(
                    "Rate limited {} notification for {}",
                    category.as_str(),
                    decision.group.fingerprint
                );
                return AlertOutcome::RateLimited;
            }
        }

        let notification = Notification::new(decision.group.clone(), decision.reason.clone());
        let result = match tokio::time::timeout(self.timeout, self.notifier.notify(&notification)).await {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout),
        };

        match result {
            Ok(()) => {
                info!(
                    "Sent notification for {} via {}: {}",
                    decision.group.fingerprint,
                    self.notifier.name(),
                    decision.reason
                );
                AlertOutcome::Sent
            }
            Err(e) => {
                warn!(
                    target: "errwatch::internal",
                    "Notifier {} failed for {}: {}",
                    self.notifier.name(),
                    decision.group.fingerprint,
                    e
                );
                AlertOutcome::Failed(e.to_string())
            }
        }
    }

    pub fn notifier_name(&self) -> &str {
        self.notifier.name()
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("notifier", &self.notifier.name())
            .field("rate_limiter", &self.rate_limiter)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn rate_limiter_from(config: &RateLimitConfig) -> Option<RateLimiter> {
    config
        .enabled
        .then(|| RateLimiter::new(config.max, config.window_minutes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::group::test_support::group_now;
    use crate::alerts::MockNotifier;

    fn approved(fp: &str) -> Decision {
        Decision {
            should_notify: true,
            reason: "test".to_string(),
            decided_by: Some("SeverityRule".to_string()),
            group: group_now(fp),
        }
    }

    fn manager(notifier: &MockNotifier, limiter: Option<RateLimiter>) -> AlertManager {
        AlertManager::new(Arc::new(notifier.clone()), limiter, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_suppressed_decision_is_not_sent() {
        let notifier = MockNotifier::new();
        let mut decision = approved("fp");
        decision.should_notify = false;

        let outcome = manager(&notifier, None).dispatch(&decision).await;
        assert_eq!(outcome, AlertOutcome::Suppressed);
        assert_eq!(notifier.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_applies_after_decision() {
        let notifier = MockNotifier::new();
        let alerts = manager(&notifier, Some(RateLimiter::new(2, 60)));

        let outcomes = vec![
            alerts.dispatch(&approved("a")).await,
            alerts.dispatch(&approved("b")).await,
            alerts.dispatch(&approved("c")).await,
        ];

        assert_eq!(outcomes.iter().filter(|o| **o == AlertOutcome::Sent).count(), 2);
        assert_eq!(outcomes[2], AlertOutcome::RateLimited);
        assert_eq!(notifier.call_count(), 2);
    }

    #[tokio::test]
    async fn test_notifier_failure_is_an_outcome() {
        let notifier = MockNotifier::failing();
        let outcome = manager(&notifier, None).dispatch(&approved("fp")).await;
        assert!(matches!(outcome, AlertOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_hanging_notifier_times_out() {
        let notifier = MockNotifier::new().with_delay(Duration::from_secs(5));
        let started = std::time::Instant::now();
        let outcome = manager(&notifier, None).dispatch(&approved("fp")).await;

        assert_eq!(outcome, AlertOutcome::Failed(NotifyError::Timeout.to_string()));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_disabled_rate_limit() {
        let config = Config {
            rate_limit: RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let alerts = AlertManager::from_config(Arc::new(MockNotifier::new()), &config);
        assert!(alerts.rate_limiter().is_none());
        assert_eq!(alerts.notifier_name(), "mock");
    }
}
