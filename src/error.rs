use thiserror::Error;

/// Errors that can occur in the durable aggregation store
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation timed out")]
    Timeout,

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Failed to decode stored row: {0}")]
    Decode(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, message)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(message.unwrap_or_else(|| code.to_string()))
            }
            rusqlite::Error::FromSqlConversionFailure(_, _, e) => StoreError::Decode(e.to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

/// Errors that can occur in the fast counter cache tier
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Cache operation timed out")]
    Timeout,
}

/// Errors reported by a notifier when handing off a notification
#[derive(Error, Debug, Clone)]
pub enum NotifyError {
    #[error("Failed to send notification: {0}")]
    DeliveryFailed(String),

    #[error("Notifier timed out")]
    Timeout,
}

/// Errors at the async dispatch boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Dispatch queue is full")]
    QueueFull,

    #[error("Dispatch queue is closed")]
    Closed,
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
