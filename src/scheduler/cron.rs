//! Cron expression helpers
//!
//! Definitions use standard 5-field cron expressions; the `cron` crate
//! wants a seconds field, so parsing normalizes first. Evaluation happens
//! in the schedule's own timezone, which keeps "every day at 9 AM"
//! meaning 9 AM local across DST transitions.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },
}

/// Parse a 5-field cron expression (seconds and year forms are accepted
/// too, for operators pasting from other tools)
pub fn parse_cron_expression(expression: &str) -> Result<Schedule, ScheduleError> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// The next occurrence strictly after `after`, evaluated in `tz`
pub fn next_occurrence_after(
    schedule: &Schedule,
    tz: Tz,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|occurrence| occurrence.with_timezone(&Utc))
}
