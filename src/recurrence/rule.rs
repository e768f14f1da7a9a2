//! Recurrence rule grammar and parser
//!
//! The rule string is a semicolon-separated KEY=VALUE list supporting
//! FREQ, INTERVAL, BYDAY, BYMONTHDAY, BYSETPOS, COUNT and UNTIL. The
//! grammar is closed: unknown keys are rejected at parse time so a typo
//! pauses a series loudly instead of silently changing its cadence.

use chrono::{NaiveDate, NaiveDateTime, Weekday};
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing or validating a recurrence rule
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("Empty recurrence rule")]
    Empty,

    #[error("Malformed clause '{clause}' (expected KEY=VALUE)")]
    MalformedClause { clause: String },

    #[error("Unknown rule key '{key}'")]
    UnknownKey { key: String },

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Rule is missing FREQ")]
    MissingFrequency,

    #[error("INTERVAL must be at least 1")]
    InvalidInterval,

    #[error("COUNT and UNTIL cannot both be set")]
    CountAndUntil,

    #[error("BYSETPOS requires BYDAY")]
    SetPosRequiresByDay,
}

/// Recurrence frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl FromStr for Frequency {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DAILY" => Ok(Frequency::Daily),
            "WEEKLY" => Ok(Frequency::Weekly),
            "MONTHLY" => Ok(Frequency::Monthly),
            "YEARLY" => Ok(Frequency::Yearly),
            _ => Err(()),
        }
    }
}

/// A parsed, validated recurrence rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub freq: Frequency,
    /// Periods between occurrences; 1 means every period
    pub interval: u32,
    /// Weekdays the rule occurs on (expands weekly/monthly periods,
    /// filters daily ones)
    pub by_day: Vec<Weekday>,
    /// Days of month, positive from the start or negative from the end
    pub by_month_day: Vec<i32>,
    /// Ordinal selection applied to a period's candidate set
    pub by_set_pos: Vec<i32>,
    /// Total number of occurrences, counted from the series start
    pub count: Option<u32>,
    /// Inclusive local wall-clock upper bound
    pub until: Option<NaiveDateTime>,
}

fn parse_weekday(s: &str) -> Option<Weekday> {
    match s {
        "MO" => Some(Weekday::Mon),
        "TU" => Some(Weekday::Tue),
        "WE" => Some(Weekday::Wed),
        "TH" => Some(Weekday::Thu),
        "FR" => Some(Weekday::Fri),
        "SA" => Some(Weekday::Sat),
        "SU" => Some(Weekday::Sun),
        _ => None,
    }
}

fn parse_until(value: &str) -> Option<NaiveDateTime> {
    let trimmed = value.strip_suffix('Z').unwrap_or(value);
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y%m%dT%H%M%S") {
        return Some(dt);
    }
    // A bare date bound includes the whole day
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y%m%d") {
        return date.and_hms_opt(23, 59, 59);
    }
    None
}

impl FromStr for RecurrenceRule {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(RuleError::Empty);
        }

        let mut freq = None;
        let mut interval = 1u32;
        let mut by_day = Vec::new();
        let mut by_month_day = Vec::new();
        let mut by_set_pos = Vec::new();
        let mut count = None;
        let mut until = None;

        for clause in trimmed.split(';') {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            let (key, value) = clause
                .split_once('=')
                .ok_or_else(|| RuleError::MalformedClause {
                    clause: clause.to_string(),
                })?;
            let invalid = || RuleError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            };

            match key {
                "FREQ" => {
                    freq = Some(value.parse::<Frequency>().map_err(|_| invalid())?);
                }
                "INTERVAL" => {
                    interval = value.parse::<u32>().map_err(|_| invalid())?;
                }
                "BYDAY" => {
                    for day in value.split(',') {
                        by_day.push(parse_weekday(day).ok_or_else(invalid)?);
                    }
                }
                "BYMONTHDAY" => {
                    for day in value.split(',') {
                        let day: i32 = day.parse().map_err(|_| invalid())?;
                        if day == 0 || day > 31 || day < -31 {
                            return Err(invalid());
                        }
                        by_month_day.push(day);
                    }
                }
                "BYSETPOS" => {
                    for pos in value.split(',') {
                        let pos: i32 = pos.parse().map_err(|_| invalid())?;
                        if pos == 0 {
                            return Err(invalid());
                        }
                        by_set_pos.push(pos);
                    }
                }
                "COUNT" => {
                    let parsed: u32 = value.parse().map_err(|_| invalid())?;
                    if parsed == 0 {
                        return Err(invalid());
                    }
                    count = Some(parsed);
                }
                "UNTIL" => {
                    until = Some(parse_until(value).ok_or_else(invalid)?);
                }
                _ => {
                    return Err(RuleError::UnknownKey {
                        key: key.to_string(),
                    });
                }
            }
        }

        let freq = freq.ok_or(RuleError::MissingFrequency)?;
        if interval == 0 {
            return Err(RuleError::InvalidInterval);
        }
        if count.is_some() && until.is_some() {
            return Err(RuleError::CountAndUntil);
        }
        if !by_set_pos.is_empty() && by_day.is_empty() {
            return Err(RuleError::SetPosRequiresByDay);
        }

        Ok(RecurrenceRule {
            freq,
            interval,
            by_day,
            by_month_day,
            by_set_pos,
            count,
            until,
        })
    }
}
