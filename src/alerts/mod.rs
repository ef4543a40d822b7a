/// Notification gate, rate limiting and notifier boundary
pub mod alert_manager;
pub mod notifier;
pub mod rate_limiter;

pub use alert_manager::{AlertManager, AlertOutcome};
pub use notifier::{
    LogNotifier, MockNotifier, Notification, NotificationCategory, Notifier, NotifyFuture,
};
pub use rate_limiter::RateLimiter;
