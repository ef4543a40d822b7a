use crate::aggregator::ErrorGroup;
use crate::analytics::ErrorSummary;
use crate::error::NotifyError;
use crate::events::truncate_text;
use log::info;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MAX_TITLE_LEN: usize = 256;
const MAX_BODY_LEN: usize = 1024;

/// Rate limiting category of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationCategory {
    Exception,
    Log,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::Exception => "exception",
            NotificationCategory::Log => "log",
        }
    }

    pub fn for_group(group: &ErrorGroup) -> Self {
        if group.classification == crate::events::LOG_CLASSIFICATION {
            NotificationCategory::Log
        } else {
            NotificationCategory::Exception
        }
    }
}

/// Everything a transport needs to deliver one notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub category: NotificationCategory,
    /// Group snapshot the decision was made on
    pub group: ErrorGroup,
    pub summary: ErrorSummary,
    /// Why the decision engine chose to notify
    pub reason: String,
    pub title: String,
    pub body: String,
}

impl Notification {
    /// Build a notification for a group with a ready-made title and body
    pub fn new(group: ErrorGroup, reason: impl Into<String>) -> Self {
        let category = NotificationCategory::for_group(&group);
        let summary = ErrorSummary::for_group(&group);
        let title = truncate_text(
            &format!(
                "[{}] {}: {}",
                group.environment, group.classification, group.message
            ),
            MAX_TITLE_LEN,
        );
        let body = truncate_text(&format_body(&group, &summary), MAX_BODY_LEN);

        Self {
            category,
            group,
            summary,
            reason: reason.into(),
            title,
            body,
        }
    }
}

/// Format the notification body from a group and its summary
///
/// Includes the location, frequency, severity, impact and up to 3
/// recommendations.
fn format_body(group: &ErrorGroup, summary: &ErrorSummary) -> String {
    let mut body = String::new();

    if let Some(ref file) = group.source_file {
        match group.source_line {
            Some(line) => body.push_str(&format!("At: {}:{}\n", file, line)),
            None => body.push_str(&format!("At: {}\n", file)),
        }
    }
    body.push_str(&format!("Frequency: {}\n", summary.frequency_analysis));
    body.push_str(&format!(
        "Severity: {} ({}/10)\n",
        summary.severity_indicator, group.severity_score
    ));
    body.push_str(&format!("Impact: {}\n", summary.impact_assessment));

    if !summary.recommendations.is_empty() {
        body.push_str("\nRecommendations:\n");
        for (i, recommendation) in summary.recommendations.iter().take(3).enumerate() {
            body.push_str(&format!("{}. {}\n", i + 1, recommendation));
        }
    }

    body.trim().to_string()
}

pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;

/// Outbound notification transport
///
/// Returning `Ok` means delivery was initiated; retries and payload templating
/// belong to the transport.
pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, notification: &'a Notification) -> NotifyFuture<'a>;

    fn name(&self) -> &str;
}

/// Notifier that writes a structured log line per notification
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl Notifier for LogNotifier {
    fn notify<'a>(&'a self, notification: &'a Notification) -> NotifyFuture<'a> {
        Box::pin(async move {
            info!(
                target: "errwatch::notify",
                "category={} fingerprint={} severity={} count={} reason=\"{}\" title=\"{}\"",
                notification.category.as_str(),
                notification.group.fingerprint,
                notification.group.severity_score,
                notification.group.occurrence_count,
                notification.reason,
                notification.title
            );
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Notifier for tests that records every call and can fail or stall
#[derive(Debug, Default, Clone)]
pub struct MockNotifier {
    calls: Arc<Mutex<Vec<Notification>>>,
    failing: Arc<AtomicBool>,
    delay: Option<Duration>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a notifier whose every call fails
    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier.set_failing(true);
        notifier
    }

    /// Sleep for `delay` before answering each call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of calls that returned `Ok`
    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Notifications delivered so far, oldest first
    pub fn notifications(&self) -> Vec<Notification> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Notifier for MockNotifier {
    fn notify<'a>(&'a self, notification: &'a Notification) -> NotifyFuture<'a> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(NotifyError::DeliveryFailed("mock notifier failure".to_string()));
            }
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(notification.clone());
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
