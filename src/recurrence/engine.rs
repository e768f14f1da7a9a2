//! Series expansion engine
//!
//! Turns a SeriesDefinition into materialized SeriesInstance rows and
//! entity records. Expansion is idempotent and safe to re-run with an
//! overlapping horizon: uniqueness lives in storage, not in this process.

use async_trait::async_trait;
use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::expand::occurrences_between;
use super::rule::{RecurrenceRule, RuleError};
use crate::config::RecurrenceConfig;
use crate::database::entities::EntityInsert;
use crate::database::Database;
use crate::jobs::store::{JobStore, NewJob};
use crate::jobs::types::{Job, JobKind, NotificationArgs, SeriesExpansionArgs};
use crate::jobs::worker::{WorkContext, WorkError, WorkOutcome, Worker};
use crate::models::{SeriesDefinition, SeriesStatus, EXCEPTION_CONFLICT_SKIPPED};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Series not found: {id}")]
    SeriesNotFound { id: Uuid },

    #[error("Invalid duration '{value}': {message}")]
    InvalidDuration { value: String, message: String },

    #[error("Invalid recurrence rule: {0}")]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Repository(#[from] anyhow::Error),
}

/// Result of one expansion pass
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpansionOutcome {
    /// False when the series was idle (paused / needs attention / drift)
    pub performed: bool,
    pub created: usize,
    pub skipped: usize,
    pub conflicts: usize,
}

/// Expands recurrence series and materializes their occurrences
#[derive(Clone)]
pub struct RecurrenceEngine {
    database: Database,
    store: Arc<dyn JobStore>,
    config: RecurrenceConfig,
}

impl RecurrenceEngine {
    pub fn new(database: Database, store: Arc<dyn JobStore>, config: RecurrenceConfig) -> Self {
        Self {
            database,
            store,
            config,
        }
    }

    /// Materialize all occurrences of a series up to `expand_until`
    pub async fn expand(
        &self,
        series_id: Uuid,
        expand_until: DateTime<Utc>,
    ) -> Result<ExpansionOutcome, EngineError> {
        let series = self
            .database
            .get_series(series_id)
            .await?
            .ok_or(EngineError::SeriesNotFound { id: series_id })?;

        if series.status != SeriesStatus::Active {
            // Paused and needs-attention series are intentionally idle
            info!(
                "Series '{}' is {}, skipping expansion",
                series.name,
                series.status.as_str()
            );
            return Ok(ExpansionOutcome::default());
        }

        // Schema-drift gate: never materialize against a table whose
        // shape no longer matches the template
        let Some(template) = series.entity_template.as_object().cloned() else {
            self.pause_for_drift(&series, vec!["entity template is not an object".to_string()])
                .await?;
            return Ok(ExpansionOutcome::default());
        };
        let findings = self
            .database
            .validate_entity_template(&series.entity_table, &template, &series.time_range_column)
            .await?;
        if !findings.is_empty() {
            self.pause_for_drift(&series, findings).await?;
            return Ok(ExpansionOutcome::default());
        }

        let duration = parse_occurrence_duration(&series.duration)?;
        let rule: RecurrenceRule = series.recurrence_rule.parse()?;
        let tz = resolve_timezone(&series.timezone, &series.name);

        // Evaluate in local wall-clock time, then reconstruct each
        // occurrence in the target timezone: "every Monday at 2 PM"
        // stays 2 PM local across DST transitions
        let local_start = series.dtstart.with_timezone(&tz).naive_local();
        let local_horizon = expand_until.with_timezone(&tz).naive_local();
        let locals = occurrences_between(&rule, local_start, local_horizon);

        let existing = self.database.existing_instance_dates(series.id).await?;
        let mut outcome = ExpansionOutcome {
            performed: true,
            ..Default::default()
        };

        for local in locals {
            let occurrence_date = local.date();
            if existing.contains(&occurrence_date) {
                outcome.skipped += 1;
                continue;
            }

            let Some(start) = local_to_instant(tz, local) else {
                warn!(
                    "Series '{}' occurrence {} has no valid instant in {}, skipping",
                    series.name, local, tz
                );
                outcome.skipped += 1;
                continue;
            };
            let end = start + duration;

            match self
                .database
                .insert_templated_entity(
                    &series.entity_table,
                    &template,
                    &series.time_range_column,
                    start,
                    end,
                )
                .await?
            {
                EntityInsert::Inserted(entity_id) => {
                    let inserted = self
                        .database
                        .insert_series_instance(series.id, occurrence_date, Some(entity_id), None)
                        .await?;
                    if inserted {
                        outcome.created += 1;
                    } else {
                        outcome.skipped += 1;
                    }
                }
                EntityInsert::OverlapConflict => {
                    warn!(
                        "Series '{}' occurrence {} overlaps an existing range, recording exception",
                        series.name, occurrence_date
                    );
                    self.database
                        .insert_series_instance(
                            series.id,
                            occurrence_date,
                            None,
                            Some(EXCEPTION_CONFLICT_SKIPPED),
                        )
                        .await?;
                    outcome.conflicts += 1;
                }
            }
        }

        self.database
            .advance_series_watermark(series.id, expand_until)
            .await?;

        info!(
            "Expanded series '{}' to {}: {} created, {} skipped, {} conflicts",
            series.name,
            expand_until.format("%Y-%m-%d %H:%M:%S UTC"),
            outcome.created,
            outcome.skipped,
            outcome.conflicts
        );
        Ok(outcome)
    }

    /// Halt a drifted series and best-effort notify its owner; a failed
    /// notification is logged, never propagated
    async fn pause_for_drift(
        &self,
        series: &SeriesDefinition,
        findings: Vec<String>,
    ) -> Result<(), EngineError> {
        let reason = format!("schema drift: {}", findings.join("; "));
        warn!("Series '{}' paused: {}", series.name, reason);
        self.database
            .set_series_status(series.id, SeriesStatus::NeedsAttention, Some(&reason))
            .await?;

        let Some(owner) = &series.owner_email else {
            return Ok(());
        };
        let args = NotificationArgs {
            recipient: owner.clone(),
            subject: format!("Series '{}' needs attention", series.name),
            body: format!(
                "Recurring series '{}' was paused and will not generate further \
                 occurrences until its template is fixed.\n\n{}",
                series.name, reason
            ),
            channels: Vec::new(),
        };
        let new_job = match NewJob::new(JobKind::NotificationDispatch, &args) {
            Ok(job) => job.with_unique_key(format!("series-drift:{}", series.id)),
            Err(e) => {
                warn!("Failed to build drift notification: {}", e);
                return Ok(());
            }
        };
        if let Err(e) = self.store.enqueue(new_job).await {
            warn!(
                "Failed to enqueue drift notification for series '{}': {}",
                series.name, e
            );
        }
        Ok(())
    }

    /// Re-enqueue the series so the horizon keeps rolling forward;
    /// deduplication makes overlapping re-enqueues harmless
    pub async fn schedule_next_expansion(
        &self,
        series_id: Uuid,
        previous_until: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let step = Duration::hours(self.config.reexpand_interval_hours);
        let next_until = previous_until + step;
        let args = SeriesExpansionArgs {
            series_id,
            expand_until: next_until,
        };
        let new_job = NewJob::new(JobKind::SeriesExpansion, &args)
            .map_err(|e| EngineError::Repository(e.into()))?
            .with_unique_key(expansion_unique_key(series_id, next_until))
            .at(Utc::now() + step);

        match self.store.enqueue(new_job).await {
            Ok(result) => {
                debug!(
                    "Follow-up expansion for series {} to {} ({})",
                    series_id,
                    next_until.format("%Y-%m-%d"),
                    if result.is_enqueued() {
                        "enqueued"
                    } else {
                        "already queued"
                    }
                );
                Ok(())
            }
            Err(e) => Err(EngineError::Repository(e.into())),
        }
    }
}

/// Dedup key for an expansion job; shared with the sweep task so both
/// producers collapse onto one job per (series, horizon date)
pub fn expansion_unique_key(series_id: Uuid, expand_until: DateTime<Utc>) -> String {
    format!("series:{}:{}", series_id, expand_until.date_naive())
}

fn resolve_timezone(name: &str, series_name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|_| {
        warn!(
            "Series '{}' has unresolvable timezone '{}', falling back to UTC",
            series_name, name
        );
        chrono_tz::UTC
    })
}

/// Parse the configured occurrence duration; invalid strings are an
/// explicit error, never a silent default
pub fn parse_occurrence_duration(value: &str) -> Result<Duration, EngineError> {
    let std_duration =
        humantime::parse_duration(value).map_err(|e| EngineError::InvalidDuration {
            value: value.to_string(),
            message: e.to_string(),
        })?;
    Duration::from_std(std_duration).map_err(|e| EngineError::InvalidDuration {
        value: value.to_string(),
        message: e.to_string(),
    })
}

/// Reconstruct a local wall-clock time as an absolute instant
///
/// Ambiguous times (DST fall-back) take the earlier offset; nonexistent
/// times (spring-forward gap) shift one hour later.
pub fn local_to_instant(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earlier, _) => Some(earlier.with_timezone(&Utc)),
        LocalResult::None => match tz.from_local_datetime(&(local + Duration::hours(1))) {
            LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earlier, _) => Some(earlier.with_timezone(&Utc)),
            LocalResult::None => None,
        },
    }
}

/// Worker adapter invoking the engine for `series.expansion` jobs
pub struct SeriesExpansionWorker {
    engine: RecurrenceEngine,
}

impl SeriesExpansionWorker {
    pub fn new(engine: RecurrenceEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Worker for SeriesExpansionWorker {
    fn kind(&self) -> JobKind {
        JobKind::SeriesExpansion
    }

    async fn work(&self, job: &Job, _ctx: &WorkContext) -> Result<WorkOutcome, WorkError> {
        let args: SeriesExpansionArgs = job
            .parse_args()
            .map_err(|e| WorkError::permanent(anyhow::anyhow!("invalid job arguments: {e}")))?;

        let outcome = self
            .engine
            .expand(args.series_id, args.expand_until)
            .await
            .map_err(|e| match e {
                EngineError::SeriesNotFound { .. }
                | EngineError::InvalidDuration { .. }
                | EngineError::Rule(_) => WorkError::permanent(e),
                EngineError::Repository(err) => WorkError::classify(err),
            })?;

        if outcome.performed {
            self.engine
                .schedule_next_expansion(args.series_id, args.expand_until)
                .await
                .map_err(|e| WorkError::transient(anyhow::Error::from(e)))?;
        }

        Ok(WorkOutcome::with_message(format!(
            "created {}, skipped {}, conflicts {}",
            outcome.created, outcome.skipped, outcome.conflicts
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use chrono::NaiveDate;

    fn test_config() -> RecurrenceConfig {
        RecurrenceConfig {
            horizon_days: 90,
            reexpand_interval_hours: 24,
        }
    }

    async fn booking_database() -> Database {
        let database = Database::new_in_memory().await.unwrap();
        database.migrate().await.unwrap();
        sqlx::query(
            "CREATE TABLE room_bookings (
                title TEXT NOT NULL,
                room TEXT NOT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL
            )",
        )
        .execute(&database.pool())
        .await
        .unwrap();
        database
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
            .and_utc()
    }

    fn series(rule: &str, dtstart: DateTime<Utc>, timezone: &str) -> SeriesDefinition {
        let now = Utc::now();
        SeriesDefinition {
            id: Uuid::new_v4(),
            name: "standup".to_string(),
            owner_email: Some("owner@example.com".to_string()),
            recurrence_rule: rule.to_string(),
            dtstart,
            duration: "30m".to_string(),
            timezone: timezone.to_string(),
            entity_table: "room_bookings".to_string(),
            entity_template: serde_json::json!({"title": "Standup", "room": "aurora"}),
            time_range_column: "window".to_string(),
            expanded_until: None,
            status: SeriesStatus::Active,
            status_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn engine_with(database: &Database) -> (RecurrenceEngine, InMemoryJobStore) {
        let store = InMemoryJobStore::new();
        let engine = RecurrenceEngine::new(database.clone(), Arc::new(store.clone()), test_config());
        (engine, store)
    }

    #[tokio::test]
    async fn test_weekly_expansion_materializes_instances() {
        let database = booking_database().await;
        let (engine, _) = engine_with(&database).await;

        // Monday 2026-01-05 09:00 UTC, four Mondays
        let def = series("FREQ=WEEKLY;BYDAY=MO;COUNT=4", utc(2026, 1, 5, 9, 0), "UTC");
        database.insert_series(&def).await.unwrap();

        let until = utc(2026, 3, 1, 0, 0);
        let outcome = engine.expand(def.id, until).await.unwrap();
        assert!(outcome.performed);
        assert_eq!(outcome.created, 4);
        assert_eq!(outcome.conflicts, 0);

        let instances = database.list_series_instances(def.id).await.unwrap();
        assert_eq!(instances.len(), 4);
        assert_eq!(
            instances[0].occurrence_date,
            NaiveDate::from_ymd_opt(2026, 1, 5).unwrap()
        );
        assert!(instances.iter().all(|i| i.entity_id.is_some()));

        // Watermark advanced
        let reloaded = database.get_series(def.id).await.unwrap().unwrap();
        assert_eq!(
            reloaded.expanded_until.unwrap().timestamp(),
            until.timestamp()
        );
    }

    #[tokio::test]
    async fn test_expansion_is_idempotent_with_overlapping_horizon() {
        let database = booking_database().await;
        let (engine, _) = engine_with(&database).await;

        let def = series("FREQ=WEEKLY;BYDAY=MO;COUNT=4", utc(2026, 1, 5, 9, 0), "UTC");
        database.insert_series(&def).await.unwrap();

        let first = engine.expand(def.id, utc(2026, 2, 1, 0, 0)).await.unwrap();
        assert_eq!(first.created, 4);

        // Overlapping, wider horizon: nothing new, nothing duplicated
        let second = engine.expand(def.id, utc(2026, 3, 1, 0, 0)).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 4);

        let instances = database.list_series_instances(def.id).await.unwrap();
        assert_eq!(instances.len(), 4);
    }

    #[tokio::test]
    async fn test_conflict_records_exception_and_continues() {
        let database = booking_database().await;
        let (engine, _) = engine_with(&database).await;

        let def = series("FREQ=DAILY;COUNT=3", utc(2026, 1, 5, 9, 0), "UTC");
        database.insert_series(&def).await.unwrap();

        // Pre-book a range overlapping the second occurrence
        let tpl = serde_json::json!({"title": "Offsite", "room": "aurora"});
        database
            .insert_templated_entity(
                "room_bookings",
                tpl.as_object().unwrap(),
                "window",
                utc(2026, 1, 6, 9, 15),
                utc(2026, 1, 6, 10, 0),
            )
            .await
            .unwrap();

        let outcome = engine.expand(def.id, utc(2026, 2, 1, 0, 0)).await.unwrap();
        assert_eq!(outcome.created, 2);
        assert_eq!(outcome.conflicts, 1);

        let instances = database.list_series_instances(def.id).await.unwrap();
        assert_eq!(instances.len(), 3);
        let exception = instances
            .iter()
            .find(|i| i.occurrence_date == NaiveDate::from_ymd_opt(2026, 1, 6).unwrap())
            .unwrap();
        assert!(exception.is_exception);
        assert_eq!(
            exception.exception_type.as_deref(),
            Some(EXCEPTION_CONFLICT_SKIPPED)
        );
        assert_eq!(exception.entity_id, None);
    }

    #[tokio::test]
    async fn test_wall_clock_preserved_across_dst_boundary() {
        let database = booking_database().await;
        let (engine, _) = engine_with(&database).await;

        // Daily 2 PM New York; US DST starts 2026-03-08
        let dtstart = utc(2026, 3, 6, 19, 0); // 14:00 EST
        let def = series("FREQ=DAILY;COUNT=4", dtstart, "America/New_York");
        database.insert_series(&def).await.unwrap();

        let outcome = engine.expand(def.id, utc(2026, 3, 15, 0, 0)).await.unwrap();
        assert_eq!(outcome.created, 4);

        let starts: Vec<String> =
            sqlx::query_scalar("SELECT window_start FROM room_bookings ORDER BY window_start")
                .fetch_all(&database.pool())
                .await
                .unwrap();
        let instants: Vec<DateTime<Utc>> = starts
            .iter()
            .map(|s| crate::database::parse_ts(s).unwrap())
            .collect();

        // 14:00 local every day: UTC-5 before the transition, UTC-4 after
        assert_eq!(instants[0], utc(2026, 3, 6, 19, 0));
        assert_eq!(instants[1], utc(2026, 3, 7, 19, 0));
        assert_eq!(instants[2], utc(2026, 3, 8, 18, 0));
        assert_eq!(instants[3], utc(2026, 3, 9, 18, 0));
    }

    #[tokio::test]
    async fn test_paused_series_is_a_successful_noop() {
        let database = booking_database().await;
        let (engine, _) = engine_with(&database).await;

        let mut def = series("FREQ=DAILY;COUNT=3", utc(2026, 1, 5, 9, 0), "UTC");
        def.status = SeriesStatus::Paused;
        database.insert_series(&def).await.unwrap();

        let outcome = engine.expand(def.id, utc(2026, 2, 1, 0, 0)).await.unwrap();
        assert!(!outcome.performed);
        assert_eq!(outcome.created, 0);
        assert!(database
            .list_series_instances(def.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_schema_drift_pauses_series_and_notifies_owner() {
        let database = booking_database().await;
        let (engine, store) = engine_with(&database).await;

        let mut def = series("FREQ=DAILY;COUNT=3", utc(2026, 1, 5, 9, 0), "UTC");
        def.entity_template = serde_json::json!({"title": "Standup", "removed_column": 1});
        database.insert_series(&def).await.unwrap();

        let outcome = engine.expand(def.id, utc(2026, 2, 1, 0, 0)).await.unwrap();
        assert!(!outcome.performed);

        let reloaded = database.get_series(def.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, SeriesStatus::NeedsAttention);
        assert!(reloaded.status_reason.unwrap().contains("schema drift"));

        // Owner notification went through the job store
        let counts = store.counts("notifications").await.unwrap();
        assert_eq!(counts.available, 1);

        // Nothing was materialized
        assert!(database
            .list_series_instances(def.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_invalid_duration_is_an_explicit_error() {
        let database = booking_database().await;
        let (engine, _) = engine_with(&database).await;

        let mut def = series("FREQ=DAILY;COUNT=3", utc(2026, 1, 5, 9, 0), "UTC");
        def.duration = "ninety minutes".to_string();
        database.insert_series(&def).await.unwrap();

        let err = engine.expand(def.id, utc(2026, 2, 1, 0, 0)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidDuration { .. }));
    }

    #[tokio::test]
    async fn test_horizon_before_start_yields_nothing() {
        let database = booking_database().await;
        let (engine, _) = engine_with(&database).await;

        let def = series("FREQ=DAILY", utc(2026, 6, 1, 9, 0), "UTC");
        database.insert_series(&def).await.unwrap();

        let outcome = engine.expand(def.id, utc(2026, 1, 1, 0, 0)).await.unwrap();
        assert!(outcome.performed);
        assert_eq!(outcome.created, 0);
    }

    #[tokio::test]
    async fn test_worker_reenqueues_follow_up_expansion() {
        let database = booking_database().await;
        let (engine, store) = engine_with(&database).await;

        let def = series("FREQ=WEEKLY;BYDAY=MO;COUNT=2", utc(2026, 1, 5, 9, 0), "UTC");
        database.insert_series(&def).await.unwrap();

        let expand_until = utc(2026, 2, 1, 0, 0);
        let args = SeriesExpansionArgs {
            series_id: def.id,
            expand_until,
        };
        let job = match store
            .enqueue(
                NewJob::new(JobKind::SeriesExpansion, &args)
                    .unwrap()
                    .with_unique_key(expansion_unique_key(def.id, expand_until)),
            )
            .await
            .unwrap()
        {
            crate::jobs::store::EnqueueResult::Enqueued(job) => job,
            crate::jobs::store::EnqueueResult::Duplicate => panic!("expected enqueue"),
        };

        let worker = SeriesExpansionWorker::new(engine);
        let ctx = WorkContext {
            deadline: Utc::now() + Duration::minutes(5),
            shutdown: tokio_util::sync::CancellationToken::new(),
        };
        let outcome = worker.work(&job, &ctx).await.unwrap();
        assert!(outcome.message.unwrap().contains("created 2"));

        // The original job plus a deduplicated follow-up for the next
        // horizon now sit in the recurrence queue
        let counts = store.counts("recurrence").await.unwrap();
        assert_eq!(counts.available, 2);
    }

    #[test]
    fn test_local_to_instant_handles_dst_gap_and_overlap() {
        let tz: Tz = "America/New_York".parse().unwrap();

        // 2026-03-08 02:30 does not exist; shifts forward one hour
        let gap = NaiveDate::from_ymd_opt(2026, 3, 8)
            .unwrap()
            .and_hms_opt(2, 30, 0)
            .unwrap();
        let resolved = local_to_instant(tz, gap).unwrap();
        assert_eq!(resolved, utc(2026, 3, 8, 7, 30)); // 03:30 EDT

        // 2026-11-01 01:30 happens twice; the earlier offset (EDT) wins
        let ambiguous = NaiveDate::from_ymd_opt(2026, 11, 1)
            .unwrap()
            .and_hms_opt(1, 30, 0)
            .unwrap();
        let resolved = local_to_instant(tz, ambiguous).unwrap();
        assert_eq!(resolved, utc(2026, 11, 1, 5, 30)); // 01:30 EDT
    }

    #[test]
    fn test_parse_occurrence_duration() {
        assert_eq!(
            parse_occurrence_duration("1h 30m").unwrap(),
            Duration::minutes(90)
        );
        assert!(parse_occurrence_duration("ninety minutes").is_err());
        assert!(parse_occurrence_duration("").is_err());
    }
}
