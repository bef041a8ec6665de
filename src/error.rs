//! Error types for the reminder engine.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Configuration errors.
///
/// Covers both process configuration (environment variables) and the
/// per-type reminder schedules a user saves. Schedule errors are scoped to a
/// single reminder type and never abort reconciliation of the others.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid time of day '{value}', expected HH:MM")]
    InvalidTimeOfDay { value: String },

    #[error("Day-of-week set is empty")]
    EmptyDaySet,

    #[error("Invalid day of week {day}, expected 0 (Sunday) through 6 (Saturday)")]
    InvalidWeekday { day: u8 },

    #[error("Invalid interval of {minutes} minutes, expected 1 to 1440")]
    InvalidInterval { minutes: i64 },

    #[error("Invalid window: start {start} is after end {end}")]
    InvalidWindow { start: String, end: String },

    #[error("Invalid UTC offset of {minutes} minutes")]
    InvalidUtcOffset { minutes: i32 },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised while handing a notification to the platform.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Notification permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Notification sink unavailable: {reason}")]
    SinkUnavailable { reason: String },

    #[error("Repository error: {0}")]
    Repository(#[from] DatabaseError),
}
