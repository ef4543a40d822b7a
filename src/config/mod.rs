/// Configuration file model, defaults and validation
#[allow(clippy::module_inception)]
pub mod config;

pub use config::{
    CacheConfig, Config, NotificationConfig, PerformanceConfig, RateLimitConfig,
    ReconciliationConfig, RetentionConfig, StoreConfig,
};
