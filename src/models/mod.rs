use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A recurring task executed on a cron cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: Uuid,
    pub name: String,
    /// Tag resolved against the schedule task registry at dispatch time
    pub target: String,
    /// Standard 5-field cron expression
    pub cron_expression: String,
    /// IANA timezone name; falls back to UTC when unresolvable
    pub timezone: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// One execution record of a ScheduleDefinition; append-only once completed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
    pub trigger_reason: TriggerReason,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub success: Option<bool>,
    pub message: Option<String>,
}

/// Why a schedule execution job was enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerReason {
    Scheduled,
    CatchUp,
    Manual,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::Scheduled => "scheduled",
            TriggerReason::CatchUp => "catch-up",
            TriggerReason::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(TriggerReason::Scheduled),
            "catch-up" => Some(TriggerReason::CatchUp),
            "manual" => Some(TriggerReason::Manual),
            _ => None,
        }
    }
}

/// A recurrence rule governing materialized entity occurrences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesDefinition {
    pub id: Uuid,
    pub name: String,
    /// Notified when the series is paused for schema drift
    pub owner_email: Option<String>,
    /// Rule string: FREQ, INTERVAL, BYDAY, BYMONTHDAY, BYSETPOS, COUNT, UNTIL
    pub recurrence_rule: String,
    pub dtstart: DateTime<Utc>,
    /// Occurrence length as a humantime string, e.g. "1h 30m"
    pub duration: String,
    pub timezone: String,
    /// Table receiving one materialized row per occurrence
    pub entity_table: String,
    /// Field -> value map inserted for each occurrence
    pub entity_template: serde_json::Value,
    /// Column prefix holding the occurrence time range
    pub time_range_column: String,
    /// Expansion watermark; advances monotonically
    pub expanded_until: Option<DateTime<Utc>>,
    pub status: SeriesStatus,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesStatus {
    Active,
    NeedsAttention,
    Paused,
}

impl SeriesStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeriesStatus::Active => "active",
            SeriesStatus::NeedsAttention => "needs_attention",
            SeriesStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SeriesStatus::Active),
            "needs_attention" => Some(SeriesStatus::NeedsAttention),
            "paused" => Some(SeriesStatus::Paused),
            _ => None,
        }
    }
}

/// One materialized occurrence of a series, unique per (series, date)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesInstance {
    pub id: Uuid,
    pub series_id: Uuid,
    /// Local calendar date of the occurrence
    pub occurrence_date: NaiveDate,
    /// Rowid of the materialized entity; None for exception instances
    pub entity_id: Option<i64>,
    pub is_exception: bool,
    pub exception_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Exception type recorded when an occurrence loses an overlap conflict
pub const EXCEPTION_CONFLICT_SKIPPED: &str = "conflict_skipped";

/// Lifecycle state of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Available,
    Running,
    Completed,
    Retryable,
    Discarded,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Retryable => "retryable",
            JobState::Discarded => "discarded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(JobState::Available),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "retryable" => Some(JobState::Retryable),
            "discarded" => Some(JobState::Discarded),
            _ => None,
        }
    }
}
