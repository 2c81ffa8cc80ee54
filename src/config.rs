//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use chrono_tz::Tz;
use std::path::PathBuf;

/// Reconcile loop period bounds, seconds.
const POLL_SECONDS_MIN: u64 = 10;
const POLL_SECONDS_MAX: u64 = 300;
const POLL_SECONDS_DEFAULT: u64 = 60;

const DEFAULT_TIMEZONE: &str = "Asia/Tokyo";
const DEFAULT_FRONTEND_BASE_URL: &str = "http://localhost:5173";

/// crondeck configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether this process should attempt to become the scheduling leader.
    pub scheduler_enabled: bool,

    /// IANA timezone used for cron interpretation and end-date comparisons.
    pub timezone: Tz,

    /// The configured timezone name, kept for messages and job snapshots.
    pub timezone_name: String,

    /// Leader lock file location.
    pub lock_path: PathBuf,

    /// If set, locks older than this are stale regardless of PID liveness.
    pub lock_stale_seconds: Option<u64>,

    /// Reconcile loop period, clamped to `[10, 300]`.
    pub poll_seconds: u64,

    /// Fallback token for scheduled GitHub workflow dispatches.
    pub github_token: Option<String>,

    /// SQLite database URL.
    pub database_url: String,

    /// Base URL for Slack deep-links into the frontend.
    pub frontend_base_url: String,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(default_database_url);

        let timezone_name = env_or("SCHEDULER_TIMEZONE", DEFAULT_TIMEZONE);
        let timezone = parse_timezone(&timezone_name);

        let lock_path = match std::env::var("SCHEDULER_LOCK_PATH") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => default_lock_path(&database_url),
        };

        Ok(Self {
            scheduler_enabled: scheduler_enabled_from_env(),
            timezone,
            timezone_name,
            lock_path,
            lock_stale_seconds: std::env::var("SCHEDULER_LOCK_STALE_SECONDS")
                .ok()
                .and_then(|raw| raw.trim().parse::<u64>().ok()),
            poll_seconds: poll_seconds_from_env(),
            github_token: std::env::var("GITHUB_TOKEN")
                .ok()
                .filter(|token| !token.is_empty()),
            database_url,
            frontend_base_url: env_or("FRONTEND_BASE_URL", DEFAULT_FRONTEND_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// Validate cross-field constraints that `from_env` tolerates.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingKey("DATABASE_URL".into()).into());
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

/// Enabled unless explicitly set to 'false'.
fn scheduler_enabled_from_env() -> bool {
    std::env::var("SCHEDULER_ENABLED")
        .map(|value| value.to_ascii_lowercase() != "false")
        .unwrap_or(true)
}

fn poll_seconds_from_env() -> u64 {
    let poll = std::env::var("SCHEDULER_POLL_SECONDS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(POLL_SECONDS_DEFAULT);
    poll.clamp(POLL_SECONDS_MIN, POLL_SECONDS_MAX)
}

/// An unrecognized zone falls back to UTC rather than failing startup;
/// the scheduler logs the substitution and keeps running.
fn parse_timezone(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!(timezone = %name, "invalid SCHEDULER_TIMEZONE, falling back to UTC");
            chrono_tz::UTC
        }
    }
}

fn default_database_url() -> String {
    let data_dir = dirs::data_dir()
        .map(|dir| dir.join("crondeck"))
        .unwrap_or_else(|| PathBuf::from("./data"));
    format!("sqlite://{}", data_dir.join("crondeck.db").display())
}

/// Default lock location:
/// - for `sqlite:///path/to/db.sqlite` -> `/path/to/scheduler.lock`
/// - otherwise -> `./scheduler.lock`
fn default_lock_path(database_url: &str) -> PathBuf {
    if let Some(db_path) = sqlite_file_path(database_url) {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                return parent.join("scheduler.lock");
            }
        }
    }
    PathBuf::from("./scheduler.lock")
}

/// Extract the filesystem path from a sqlite URL, if there is one.
fn sqlite_file_path(database_url: &str) -> Option<PathBuf> {
    let rest = database_url.strip_prefix("sqlite://").or_else(|| {
        database_url.strip_prefix("sqlite:")
    })?;
    let path = rest.trim_start_matches("//");
    if path.is_empty() || path.starts_with(':') {
        // e.g. sqlite::memory:
        return None;
    }
    Some(PathBuf::from(path))
}
