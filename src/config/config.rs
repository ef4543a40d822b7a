use crate::error::ConfigError;
use crate::events::Level;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted counter window (7 days)
pub const MAX_CACHE_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;
/// Longest accepted reconciliation interval (1 day)
pub const MAX_RECONCILE_INTERVAL_SECONDS: u64 = 24 * 60 * 60;
/// Longest accepted base retry delay (1 hour)
pub const MAX_BASE_DELAY_MS: u64 = 60 * 60 * 1000;

/// Top-level configuration, loaded from a TOML file
///
/// Every section falls back to its defaults when omitted, so an empty file is a
/// valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Master switch; when false every ingest is a no-op
    pub enabled: bool,
    /// Environment assigned to events that do not name one
    pub environment: String,
    /// Environments to track; empty means all
    pub environments: Vec<String>,
    /// Exception classes that are never tracked
    pub ignore_exceptions: Vec<String>,
    /// Log levels that are tracked (exceptions are always tracked)
    pub report_levels: Vec<Level>,
    pub notification: NotificationConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub performance: PerformanceConfig,
    pub reconciliation: ReconciliationConfig,
    pub store: StoreConfig,
    pub retention: RetentionConfig,
}

/// Thresholds for the notification decision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationConfig {
    /// Severity score at or above which a group always notifies
    pub min_severity: u8,
    /// Lifetime occurrence count at or above which a group notifies
    pub frequency_threshold: u64,
    /// Occurrences within the hourly window at or above which a group notifies
    pub hourly_threshold: u64,
    /// Minimum minutes between two notifications for the same group
    pub cooldown_minutes: u64,
    /// Let the severity rule notify even inside the cooldown
    pub severity_bypasses_cooldown: bool,
    /// Clear the resolved flag when a resolved group occurs again
    pub reopen_resolved: bool,
}

/// Global notification volume limit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Notifications allowed per category per window
    pub max: u64,
    pub window_minutes: u64,
}

/// Fast counter cache tier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Length of each counter window
    pub ttl_seconds: u64,
    pub key_prefix: String,
    pub max_entries: u64,
}

/// Dispatch and timeout settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Hand events to a worker pool instead of processing them inline
    pub async_enabled: bool,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Upper bound for every cache, store and notifier call
    pub operation_timeout_ms: u64,
}

/// Retry policy for deferred and failed durable writes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub interval_seconds: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_pending: usize,
}

/// Durable store location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path; omitted means an in-memory store
    pub path: Option<PathBuf>,
}

/// Retention sweep settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Resolved groups older than this many days are deleted by cleanup
    pub resolved_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            environment: "production".to_string(),
            environments: Vec::new(),
            ignore_exceptions: Vec::new(),
            report_levels: vec![Level::Error, Level::Critical, Level::Alert, Level::Emergency],
            notification: NotificationConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            performance: PerformanceConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            store: StoreConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            min_severity: 7,
            frequency_threshold: 10,
            hourly_threshold: 5,
            cooldown_minutes: 60,
            severity_bypasses_cooldown: true,
            reopen_resolved: false,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max: 10,
            window_minutes: 10,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,
            key_prefix: "watchdog".to_string(),
            max_entries: 100_000,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            async_enabled: true,
            workers: 2,
            queue_capacity: 1024,
            operation_timeout_ms: 1000,
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            max_attempts: 5,
            base_delay_ms: 500,
            max_pending: 10_000,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { resolved_days: 30 }
    }
}

impl Config {
    /// Load and validate a configuration file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read,
    /// `ConfigError::TomlError` if it is not valid TOML and
    /// `ConfigError::ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value is in range
    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = &self.notification;
        if !(1..=10).contains(&n.min_severity) {
            return Err(invalid("notification.min_severity must be between 1 and 10"));
        }
        if n.frequency_threshold == 0 {
            return Err(invalid("notification.frequency_threshold must be at least 1"));
        }
        if n.hourly_threshold == 0 {
            return Err(invalid("notification.hourly_threshold must be at least 1"));
        }
        if self.environment.trim().is_empty() {
            return Err(invalid("environment must not be empty"));
        }
        if self.rate_limit.max == 0 {
            return Err(invalid("rate_limit.max must be at least 1"));
        }
        if self.rate_limit.window_minutes == 0 {
            return Err(invalid("rate_limit.window_minutes must be at least 1"));
        }
        if !(1..=MAX_CACHE_TTL_SECONDS).contains(&self.cache.ttl_seconds) {
            return Err(invalid(&format!(
                "cache.ttl_seconds must be between 1 and {}",
                MAX_CACHE_TTL_SECONDS
            )));
        }
        if self.cache.key_prefix.is_empty() {
            return Err(invalid("cache.key_prefix must not be empty"));
        }
        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries must be at least 1"));
        }
        let p = &self.performance;
        if p.workers == 0 || p.queue_capacity == 0 || p.operation_timeout_ms == 0 {
            return Err(invalid(
                "performance.workers, queue_capacity and operation_timeout_ms must be positive",
            ));
        }
        let r = &self.reconciliation;
        if r.interval_seconds == 0 || r.max_attempts == 0 || r.max_pending == 0 {
            return Err(invalid(
                "reconciliation.interval_seconds, max_attempts and max_pending must be positive",
            ));
        }
        if r.interval_seconds > MAX_RECONCILE_INTERVAL_SECONDS {
            return Err(invalid(&format!(
                "reconciliation.interval_seconds must be at most {}",
                MAX_RECONCILE_INTERVAL_SECONDS
            )));
        }
        if r.base_delay_ms > MAX_BASE_DELAY_MS {
            return Err(invalid(&format!(
                "reconciliation.base_delay_ms must be at most {}",
                MAX_BASE_DELAY_MS
            )));
        }
        if self.retention.resolved_days == 0 {
            return Err(invalid("retention.resolved_days must be at least 1"));
        }
        Ok(())
    }

    /// Copy of this configuration with every invalid value replaced by its default
    ///
    /// Used by the engine so that a bad value degrades one setting instead of
    /// disabling tracking.
    pub fn sanitized(&self) -> Self {
        let defaults = Config::default();
        let mut config = self.clone();

        if config.environment.trim().is_empty() {
            warn!("Empty environment, using {}", defaults.environment);
            config.environment = defaults.environment.clone();
        }

        let n = &mut config.notification;
        let dn = &defaults.notification;
        if !(1..=10).contains(&n.min_severity) {
            warn!("Invalid min_severity {}, using {}", n.min_severity, dn.min_severity);
            n.min_severity = dn.min_severity;
        }
        fix_zero(&mut n.frequency_threshold, dn.frequency_threshold, "frequency_threshold");
        fix_zero(&mut n.hourly_threshold, dn.hourly_threshold, "hourly_threshold");

        fix_zero(&mut config.rate_limit.max, defaults.rate_limit.max, "rate_limit.max");
        fix_zero(
            &mut config.rate_limit.window_minutes,
            defaults.rate_limit.window_minutes,
            "rate_limit.window_minutes",
        );

        fix_zero(&mut config.cache.ttl_seconds, defaults.cache.ttl_seconds, "cache.ttl_seconds");
        cap(&mut config.cache.ttl_seconds, MAX_CACHE_TTL_SECONDS, "cache.ttl_seconds");
        fix_zero(&mut config.cache.max_entries, defaults.cache.max_entries, "cache.max_entries");
        if config.cache.key_prefix.is_empty() {
            warn!("Empty cache.key_prefix, using {}", defaults.cache.key_prefix);
            config.cache.key_prefix = defaults.cache.key_prefix.clone();
        }

        let p = &mut config.performance;
        let dp = &defaults.performance;
        fix_zero(&mut p.workers, dp.workers, "performance.workers");
        fix_zero(&mut p.queue_capacity, dp.queue_capacity, "performance.queue_capacity");
        fix_zero(
            &mut p.operation_timeout_ms,
            dp.operation_timeout_ms,
            "performance.operation_timeout_ms",
        );

        let r = &mut config.reconciliation;
        let dr = &defaults.reconciliation;
        fix_zero(&mut r.interval_seconds, dr.interval_seconds, "reconciliation.interval_seconds");
        cap(
            &mut r.interval_seconds,
            MAX_RECONCILE_INTERVAL_SECONDS,
            "reconciliation.interval_seconds",
        );
        cap(&mut r.base_delay_ms, MAX_BASE_DELAY_MS, "reconciliation.base_delay_ms");
        fix_zero(&mut r.max_attempts, dr.max_attempts, "reconciliation.max_attempts");
        fix_zero(&mut r.max_pending, dr.max_pending, "reconciliation.max_pending");

        fix_zero(
            &mut config.retention.resolved_days,
            defaults.retention.resolved_days,
            "retention.resolved_days",
        );

        config
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.performance.operation_timeout_ms)
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}

fn cap(value: &mut u64, max: u64, name: &str) {
    if *value > max {
        warn!("{} {} is too large, using {}", name, value, max);
        *value = max;
    }
}

fn fix_zero<T>(value: &mut T, default: T, name: &str)
where
    T: PartialEq + Default + Copy + std::fmt::Display,
{
    if *value == T::default() {
        warn!("Invalid {} {}, using {}", name, value, default);
        *value = default;
    }
}
