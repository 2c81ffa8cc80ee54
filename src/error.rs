//! Top-level error types for crondeck.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Scheduling errors surfaced by the trigger engine and reconciler.
///
/// `InvalidCron` messages are shown verbatim to API clients on job writes,
/// so they name the expression and the expected format.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("scheduler is not running as leader in this process")]
    NotLeader,

    #[error("trigger engine is stopped")]
    EngineStopped,

    #[error("scheduled job not found: {0}")]
    JobNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
