/// Error types for stores, caches, notifiers and configuration
pub mod error;

/// Input events and payload normalization
pub mod events;

/// Stable grouping keys for events
pub mod fingerprint;

/// Severity scoring
pub mod severity;

/// Error groups and the durable aggregation stores
pub mod aggregator;

/// Fast counter cache tier and group snapshots
pub mod cache;

/// Notification decision rules
pub mod triggers;

/// Rate limiting and the notifier boundary
pub mod alerts;

/// Trend, pattern and statistics reporting
pub mod analytics;

/// Self-monitoring counters
pub mod monitoring;

/// Retry queue for deferred durable writes
pub mod reconcile;

/// Dual-path occurrence tracking
pub mod tracker;

/// Bounded async worker pool
pub mod dispatch;

/// Top-level watchdog facade
pub mod watchdog;

/// Configuration management
pub mod config;

// Re-export commonly used types
pub use aggregator::{AggregationStore, ErrorGroup, InMemoryStore, SqliteStore};
pub use alerts::{LogNotifier, MockNotifier, Notification, Notifier};
pub use config::Config;
pub use error::{CacheError, ConfigError, DispatchError, NotifyError, StoreError};
pub use events::{Event, Level};
pub use tracker::TrackOutcome;
pub use triggers::Decision;
pub use watchdog::{ProcessReport, Watchdog, WatchdogBuilder};
