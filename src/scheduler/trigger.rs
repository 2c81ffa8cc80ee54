//! Five-field cron parsing and DST-aware fire-time computation.
//!
//! Job schedules are classic five-field cron (`minute hour day-of-month month
//! day-of-week`). Field matches are interpreted in the configured IANA zone;
//! the computed instants come back in UTC.

use crate::error::ScheduleError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct CronTrigger {
    schedule: Schedule,
    timezone: Tz,
    expression: String,
}

impl CronTrigger {
    /// Parse a five-field cron expression. Any other field count is an error
    /// whose message is safe to surface through the API.
    pub fn parse(expression: &str, timezone: Tz) -> Result<Self, ScheduleError> {
        let expression = expression.trim();
        let field_count = expression.split_whitespace().count();
        if field_count != 5 {
            return Err(ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason: format!(
                    "expected 5 fields (minute hour day-of-month month day-of-week), got {field_count}"
                ),
            });
        }

        // The cron crate wants a seconds field; pin it to the top of the minute.
        let with_seconds = format!("0 {expression}");
        let schedule =
            Schedule::from_str(&with_seconds).map_err(|error| ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason: error.to_string(),
            })?;

        Ok(Self {
            schedule,
            timezone,
            expression: expression.to_string(),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// The first fire time strictly after `after`, or None when the schedule
    /// has run out (e.g. a fixed date in the past).
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.schedule
            .after(&local)
            .next()
            .map(|fire| fire.with_timezone(&Utc))
    }

    /// The next `count` fire times after now, for validation and preview
    /// endpoints.
    pub fn preview(&self, count: usize) -> Vec<DateTime<Utc>> {
        let now = Utc::now().with_timezone(&self.timezone);
        self.schedule
            .after(&now)
            .take(count)
            .map(|fire| fire.with_timezone(&Utc))
            .collect()
    }
}
