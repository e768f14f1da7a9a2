//! Job envelope and kind definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{JobState, TriggerReason};

/// Priority levels for job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobPriority {
    /// Recovery and startup work
    Critical = 0,
    /// Manual user triggers
    High = 1,
    /// Regular scheduled work
    Normal = 2,
    /// Background maintenance
    Low = 3,
}

impl JobPriority {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => JobPriority::Critical,
            1 => JobPriority::High,
            3 => JobPriority::Low,
            _ => JobPriority::Normal,
        }
    }
}

impl PartialOrd for JobPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JobPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

/// The closed set of job kinds this engine executes
///
/// Work is never dispatched by an arbitrary function name; every kind in
/// this registry maps to exactly one typed handler, and unknown tags are
/// rejected at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Deliver a notification through the registered channel transports
    NotificationDispatch,
    /// Expand a recurrence series up to a horizon
    SeriesExpansion,
    /// Execute a schedule definition's target task
    ScheduleExecution,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::NotificationDispatch => "notification.dispatch",
            JobKind::SeriesExpansion => "series.expansion",
            JobKind::ScheduleExecution => "schedule.execution",
        }
    }

    /// Queue this kind executes on
    pub fn queue(&self) -> &'static str {
        match self {
            JobKind::NotificationDispatch => "notifications",
            JobKind::SeriesExpansion => "recurrence",
            JobKind::ScheduleExecution => "schedules",
        }
    }

    pub fn default_priority(&self) -> JobPriority {
        match self {
            JobKind::NotificationDispatch => JobPriority::Normal,
            JobKind::SeriesExpansion => JobPriority::Normal,
            JobKind::ScheduleExecution => JobPriority::Normal,
        }
    }

    /// Attempt ceiling, including the first attempt
    pub fn max_attempts(&self) -> i32 {
        match self {
            JobKind::NotificationDispatch => 5,
            JobKind::SeriesExpansion => 3,
            JobKind::ScheduleExecution => 3,
        }
    }

    pub fn all() -> &'static [JobKind] {
        &[
            JobKind::NotificationDispatch,
            JobKind::SeriesExpansion,
            JobKind::ScheduleExecution,
        ]
    }
}

/// Error for unrecognized kind tags
#[derive(Debug, thiserror::Error)]
#[error("Unknown job kind: '{0}'")]
pub struct UnknownJobKind(pub String);

impl FromStr for JobKind {
    type Err = UnknownJobKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownJobKind(s.to_string()))
    }
}

/// One unit of queued work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub args: serde_json::Value,
    pub queue: String,
    pub priority: JobPriority,
    /// Attempts consumed so far, including the current one while running
    pub attempt: i32,
    pub max_attempts: i32,
    /// Dedup key; at most one non-discarded job per (kind, unique_key)
    pub unique_key: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub state: JobState,
    pub leased_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Available | JobState::Retryable)
            && self.scheduled_at <= now
    }

    /// Deserialize the args payload into the kind's typed arguments
    pub fn parse_args<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.args.clone())
    }
}

/// Arguments for a schedule execution job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleExecutionArgs {
    pub schedule_id: Uuid,
    pub target: String,
    pub scheduled_for: DateTime<Utc>,
    pub reason: TriggerReason,
}

/// Arguments for a series expansion job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesExpansionArgs {
    pub series_id: Uuid,
    pub expand_until: DateTime<Utc>,
}

/// Arguments for a notification dispatch job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationArgs {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// Channel names to attempt; empty means every registered channel
    #[serde(default)]
    pub channels: Vec<String>,
}
