//! Schedule targets and the worker executing them
//!
//! A schedule definition names its target by tag, and the tag resolves
//! through a closed registry of typed tasks. Unknown targets fail the
//! job permanently instead of being dispatched to arbitrary code.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{RecurrenceConfig, SchedulerConfig};
use crate::database::Database;
use crate::jobs::store::{JobStore, NewJob};
use crate::jobs::types::{Job, JobKind, ScheduleExecutionArgs, SeriesExpansionArgs};
use crate::jobs::worker::{WorkContext, WorkError, WorkOutcome, Worker};
use crate::recurrence::engine::expansion_unique_key;

/// Built-in schedule seeded at startup: rolls series horizons forward
pub const TARGET_SERIES_EXPANSION_SWEEP: &str = "series-expansion-sweep";
/// Built-in schedule seeded at startup: prunes old history
pub const TARGET_HISTORY_CLEANUP: &str = "history-cleanup";

/// Context handed to a schedule task
#[derive(Clone)]
pub struct TaskContext {
    pub database: Database,
    pub store: Arc<dyn JobStore>,
    pub recurrence: RecurrenceConfig,
    pub scheduler: SchedulerConfig,
    /// The occurrence this execution is for
    pub scheduled_for: DateTime<Utc>,
}

/// One schedule target; returns a human-readable result message
#[async_trait]
pub trait ScheduleTask: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &TaskContext) -> Result<String, WorkError>;
}

/// Closed mapping from target tags to tasks
#[derive(Default)]
pub struct ScheduleTaskRegistry {
    tasks: HashMap<&'static str, Arc<dyn ScheduleTask>>,
}

impl ScheduleTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, task: Arc<dyn ScheduleTask>) -> Self {
        self.tasks.insert(task.name(), task);
        self
    }

    /// Registry with the engine's built-in targets
    pub fn with_builtin_tasks() -> Self {
        Self::new()
            .register(Arc::new(SeriesExpansionSweep))
            .register(Arc::new(HistoryCleanup))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ScheduleTask>> {
        self.tasks.get(name).cloned()
    }
}

/// Enqueue expansion jobs for every active series whose watermark lags
/// the horizon; pairs with each expansion's own re-enqueue as a safety
/// net for series that missed theirs
pub struct SeriesExpansionSweep;

#[async_trait]
impl ScheduleTask for SeriesExpansionSweep {
    fn name(&self) -> &'static str {
        TARGET_SERIES_EXPANSION_SWEEP
    }

    async fn run(&self, ctx: &TaskContext) -> Result<String, WorkError> {
        let horizon = Utc::now() + Duration::days(ctx.recurrence.horizon_days);
        let series = ctx
            .database
            .list_series_needing_expansion(horizon)
            .await
            .map_err(WorkError::classify)?;

        let mut enqueued = 0;
        for definition in &series {
            let args = SeriesExpansionArgs {
                series_id: definition.id,
                expand_until: horizon,
            };
            let new_job = NewJob::new(JobKind::SeriesExpansion, &args)
                .map_err(|e| WorkError::permanent(anyhow::Error::from(e)))?
                .with_unique_key(expansion_unique_key(definition.id, horizon));

            match ctx.store.enqueue(new_job).await {
                Ok(result) if result.is_enqueued() => enqueued += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "Failed to enqueue expansion for series '{}': {}",
                        definition.name, e
                    );
                }
            }
        }

        Ok(format!(
            "enqueued {} of {} series for expansion to {}",
            enqueued,
            series.len(),
            horizon.format("%Y-%m-%d")
        ))
    }
}

/// Prune completed run history and finished jobs past retention
pub struct HistoryCleanup;

#[async_trait]
impl ScheduleTask for HistoryCleanup {
    fn name(&self) -> &'static str {
        TARGET_HISTORY_CLEANUP
    }

    async fn run(&self, ctx: &TaskContext) -> Result<String, WorkError> {
        let cutoff = Utc::now() - Duration::days(ctx.scheduler.history_retention_days);

        let runs = ctx
            .database
            .prune_schedule_runs(cutoff)
            .await
            .map_err(WorkError::classify)?;
        let jobs = ctx
            .store
            .prune_finished(cutoff)
            .await
            .map_err(|e| WorkError::classify(anyhow::Error::from(e)))?;

        Ok(format!("pruned {runs} schedule runs and {jobs} finished jobs"))
    }
}

/// Worker executing `schedule.execution` jobs
///
/// Every attempt is recorded as a ScheduleRun, successful or not, so
/// operators can see retries and terminal failures in the history.
pub struct ScheduleExecutionWorker {
    database: Database,
    store: Arc<dyn JobStore>,
    registry: Arc<ScheduleTaskRegistry>,
    recurrence: RecurrenceConfig,
    scheduler: SchedulerConfig,
}

impl ScheduleExecutionWorker {
    pub fn new(
        database: Database,
        store: Arc<dyn JobStore>,
        registry: Arc<ScheduleTaskRegistry>,
        recurrence: RecurrenceConfig,
        scheduler: SchedulerConfig,
    ) -> Self {
        Self {
            database,
            store,
            registry,
            recurrence,
            scheduler,
        }
    }
}

#[async_trait]
impl Worker for ScheduleExecutionWorker {
    fn kind(&self) -> JobKind {
        JobKind::ScheduleExecution
    }

    async fn work(&self, job: &Job, _ctx: &WorkContext) -> Result<WorkOutcome, WorkError> {
        let args: ScheduleExecutionArgs = job
            .parse_args()
            .map_err(|e| WorkError::permanent(anyhow::anyhow!("invalid job arguments: {e}")))?;

        let started_at = Utc::now();
        let run_id = self
            .database
            .insert_schedule_run(args.schedule_id, args.scheduled_for, args.reason, started_at)
            .await
            .map_err(WorkError::classify)?;

        let result = match self.registry.get(&args.target) {
            Some(task) => {
                let ctx = TaskContext {
                    database: self.database.clone(),
                    store: self.store.clone(),
                    recurrence: self.recurrence.clone(),
                    scheduler: self.scheduler.clone(),
                    scheduled_for: args.scheduled_for,
                };
                task.run(&ctx).await
            }
            None => Err(WorkError::permanent(anyhow::anyhow!(
                "unknown schedule target '{}'",
                args.target
            ))),
        };

        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds();

        match result {
            Ok(message) => {
                self.database
                    .complete_schedule_run(run_id, true, &message, completed_at, duration_ms)
                    .await
                    .map_err(WorkError::classify)?;
                self.database
                    .advance_schedule_last_run(args.schedule_id, args.scheduled_for)
                    .await
                    .map_err(WorkError::classify)?;
                info!(
                    "Schedule target '{}' ({}) completed: {}",
                    args.target,
                    args.reason.as_str(),
                    message
                );
                Ok(WorkOutcome::with_message(message))
            }
            Err(work_error) => {
                let message = format!("{work_error}");
                if let Err(e) = self
                    .database
                    .complete_schedule_run(run_id, false, &message, completed_at, duration_ms)
                    .await
                {
                    warn!("Failed to record failed schedule run: {}", e);
                }
                Err(work_error)
            }
        }
    }
}
