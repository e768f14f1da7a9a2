//! Periodic scheduler loop
//!
//! Every tick loads the enabled schedule definitions, computes which
//! occurrences are due, and enqueues one execution job per occurrence.
//! There is deliberately no leader election: each occurrence's dedup key
//! is unique, so any number of concurrent scheduler instances collapse
//! onto a single enqueued job per due occurrence.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::sync::Arc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cron::parse_cron_expression;
use crate::config::SchedulerConfig;
use crate::database::Database;
use crate::jobs::store::{JobStore, NewJob};
use crate::jobs::types::{JobKind, ScheduleExecutionArgs};
use crate::models::{ScheduleDefinition, TriggerReason};

/// Upper bound on occurrences handled for one definition in one tick;
/// the catch-up window already bounds this for any 5-field cadence
const MAX_OCCURRENCES_PER_TICK: usize = 2000;

pub struct SchedulerService {
    database: Database,
    store: Arc<dyn JobStore>,
    config: SchedulerConfig,
}

impl SchedulerService {
    pub fn new(database: Database, store: Arc<dyn JobStore>, config: SchedulerConfig) -> Self {
        Self {
            database,
            store,
            config,
        }
    }

    /// Run the scheduler loop until the token is cancelled
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<()> {
        info!(
            "Starting scheduler service (tick: {}s, catch-up window: {}h)",
            self.config.tick_interval_secs, self.config.catchup_window_hours
        );
        let mut tick = interval(std::time::Duration::from_secs(
            self.config.tick_interval_secs.max(1),
        ));

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Scheduler tick failed: {}", e);
                    }
                }
                _ = cancellation_token.cancelled() => {
                    info!("Scheduler service received cancellation signal, shutting down");
                    break;
                }
            }
        }

        info!("Scheduler service stopped");
        Ok(())
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        debug!(
            "Scheduler tick at {}",
            now.format("%Y-%m-%d %H:%M:%S UTC")
        );

        let definitions = self.database.list_enabled_schedules().await?;
        for definition in definitions {
            // One broken definition never takes down the tick
            match self.check_definition(&definition, now).await {
                Ok(0) => {}
                Ok(enqueued) => {
                    info!(
                        "Schedule '{}' enqueued {} execution job(s)",
                        definition.name, enqueued
                    );
                }
                Err(e) => {
                    warn!("Failed to evaluate schedule '{}': {}", definition.name, e);
                }
            }
        }
        Ok(())
    }

    /// Evaluate one definition and enqueue its due occurrences; returns
    /// how many jobs were newly enqueued
    pub async fn check_definition(
        &self,
        definition: &ScheduleDefinition,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let schedule = parse_cron_expression(&definition.cron_expression)?;
        let tz = resolve_timezone(&definition.timezone, &definition.name);
        let window = Duration::hours(self.config.catchup_window_hours);

        let occurrences = due_occurrences(&schedule, tz, definition, now, window);
        if occurrences.is_empty() {
            if let Some(next) = schedule.after(&now.with_timezone(&tz)).next() {
                debug!(
                    "Schedule '{}' not due; next occurrence {}",
                    definition.name,
                    next.with_timezone(&Utc).format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            return Ok(0);
        }

        let mut enqueued = 0;
        for occurrence in occurrences {
            // More than an hour past due counts as catch-up
            let reason = if now - occurrence > Duration::hours(1) {
                TriggerReason::CatchUp
            } else {
                TriggerReason::Scheduled
            };
            let args = ScheduleExecutionArgs {
                schedule_id: definition.id,
                target: definition.target.clone(),
                scheduled_for: occurrence,
                reason,
            };
            let new_job = NewJob::new(JobKind::ScheduleExecution, &args)?
                .with_unique_key(occurrence_unique_key(definition, occurrence))
                .at(occurrence);

            match self.store.enqueue(new_job).await {
                Ok(result) if result.is_enqueued() => {
                    debug!(
                        "Enqueued {} run of '{}' for {}",
                        reason.as_str(),
                        definition.name,
                        occurrence.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                    enqueued += 1;
                }
                Ok(_) => {
                    debug!(
                        "Occurrence {} of '{}' already enqueued, skipping",
                        occurrence.format("%Y-%m-%d %H:%M:%S UTC"),
                        definition.name
                    );
                }
                Err(e) => {
                    // Enqueue failures are retried on the next tick
                    warn!(
                        "Failed to enqueue occurrence {} of '{}': {}",
                        occurrence.format("%Y-%m-%d %H:%M:%S UTC"),
                        definition.name,
                        e
                    );
                }
            }
        }
        Ok(enqueued)
    }
}

/// Dedup key tying a job to one logical occurrence of one schedule
fn occurrence_unique_key(
    definition: &ScheduleDefinition,
    occurrence: DateTime<Utc>,
) -> String {
    format!("sched:{}:{}", definition.id, occurrence.timestamp())
}

/// All due occurrences of a definition, oldest first
///
/// The base is the last successful run when one exists, otherwise the
/// creation time; either way it is clamped to the catch-up window so a
/// long-idle schedule cannot flood the queue with historical occurrences.
pub fn due_occurrences(
    schedule: &Schedule,
    tz: Tz,
    definition: &ScheduleDefinition,
    now: DateTime<Utc>,
    catchup_window: Duration,
) -> Vec<DateTime<Utc>> {
    let anchor = definition.last_run_at.unwrap_or(definition.created_at);
    let base = anchor.max(now - catchup_window);

    schedule
        .after(&base.with_timezone(&tz))
        .map(|occurrence| occurrence.with_timezone(&Utc))
        .take_while(|occurrence| *occurrence <= now)
        .take(MAX_OCCURRENCES_PER_TICK)
        .collect()
}

fn resolve_timezone(name: &str, schedule_name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|_| {
        warn!(
            "Schedule '{}' has unresolvable timezone '{}', falling back to UTC",
            schedule_name, name
        );
        chrono_tz::UTC
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
            .and_utc()
    }

    fn definition(
        cron_expression: &str,
        timezone: &str,
        created_at: DateTime<Utc>,
        last_run_at: Option<DateTime<Utc>>,
    ) -> ScheduleDefinition {
        ScheduleDefinition {
            id: Uuid::new_v4(),
            name: "hourly-sweep".to_string(),
            target: "series-expansion-sweep".to_string(),
            cron_expression: cron_expression.to_string(),
            timezone: timezone.to_string(),
            enabled: true,
            created_at,
            updated_at: created_at,
            last_run_at,
        }
    }

    async fn service_with_store() -> (SchedulerService, InMemoryJobStore) {
        let database = crate::database::Database::new_in_memory().await.unwrap();
        database.migrate().await.unwrap();
        let store = InMemoryJobStore::new();
        let service = SchedulerService::new(
            database,
            Arc::new(store.clone()),
            SchedulerConfig {
                tick_interval_secs: 60,
                catchup_window_hours: 24,
                history_retention_days: 14,
            },
        );
        (service, store)
    }

    #[test]
    fn test_due_occurrences_catch_up_after_downtime() {
        // Hourly schedule whose last run was three hours ago
        let schedule = parse_cron_expression("0 * * * *").unwrap();
        let now = utc(2026, 8, 6, 12, 30);
        let def = definition(
            "0 * * * *",
            "UTC",
            utc(2026, 8, 1, 0, 0),
            Some(utc(2026, 8, 6, 9, 30)),
        );

        let due = due_occurrences(&schedule, chrono_tz::UTC, &def, now, Duration::hours(24));
        assert_eq!(
            due,
            vec![
                utc(2026, 8, 6, 10, 0),
                utc(2026, 8, 6, 11, 0),
                utc(2026, 8, 6, 12, 0),
            ]
        );
    }

    #[test]
    fn test_due_occurrences_cap_lookback_for_old_schedules() {
        // Created weeks ago, never run: only the last 24h count
        let schedule = parse_cron_expression("0 */6 * * *").unwrap();
        let now = utc(2026, 8, 6, 12, 30);
        let def = definition("0 */6 * * *", "UTC", utc(2026, 7, 1, 0, 0), None);

        let due = due_occurrences(&schedule, chrono_tz::UTC, &def, now, Duration::hours(24));
        assert_eq!(
            due,
            vec![
                utc(2026, 8, 5, 18, 0),
                utc(2026, 8, 6, 0, 0),
                utc(2026, 8, 6, 6, 0),
                utc(2026, 8, 6, 12, 0),
            ]
        );
    }

    #[test]
    fn test_due_occurrences_bound_long_downtime() {
        // Last run three days ago: catch-up stays inside the window
        let schedule = parse_cron_expression("0 * * * *").unwrap();
        let now = utc(2026, 8, 6, 12, 30);
        let def = definition(
            "0 * * * *",
            "UTC",
            utc(2026, 7, 1, 0, 0),
            Some(utc(2026, 8, 3, 12, 0)),
        );

        let due = due_occurrences(&schedule, chrono_tz::UTC, &def, now, Duration::hours(24));
        assert_eq!(due.len(), 24);
        assert_eq!(due[0], utc(2026, 8, 5, 13, 0));
        assert_eq!(due[23], utc(2026, 8, 6, 12, 0));
    }

    #[test]
    fn test_future_schedule_is_not_due() {
        let schedule = parse_cron_expression("0 * * * *").unwrap();
        let now = utc(2026, 8, 6, 12, 30);
        let def = definition(
            "0 * * * *",
            "UTC",
            utc(2026, 8, 6, 12, 0),
            Some(utc(2026, 8, 6, 12, 0)),
        );

        let due = due_occurrences(&schedule, chrono_tz::UTC, &def, now, Duration::hours(24));
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn test_check_definition_enqueues_with_distinct_keys() {
        let (service, store) = service_with_store().await;
        let now = utc(2026, 8, 6, 12, 30);
        let def = definition(
            "0 * * * *",
            "UTC",
            utc(2026, 8, 1, 0, 0),
            Some(utc(2026, 8, 6, 9, 30)),
        );

        let enqueued = service.check_definition(&def, now).await.unwrap();
        assert_eq!(enqueued, 3);

        let counts = store.counts("schedules").await.unwrap();
        assert_eq!(counts.available, 3);
    }

    #[tokio::test]
    async fn test_concurrent_scheduler_instances_never_duplicate() {
        let (service, store) = service_with_store().await;
        let now = utc(2026, 8, 6, 12, 30);
        let def = definition(
            "0 * * * *",
            "UTC",
            utc(2026, 8, 1, 0, 0),
            Some(utc(2026, 8, 6, 9, 30)),
        );

        // A second instance sharing the same store races on the same tick
        let first = service.check_definition(&def, now).await.unwrap();
        let second = service.check_definition(&def, now).await.unwrap();
        assert_eq!(first, 3);
        assert_eq!(second, 0);

        let counts = store.counts("schedules").await.unwrap();
        assert_eq!(counts.available, 3);
    }

    #[tokio::test]
    async fn test_catch_up_reason_for_old_occurrences() {
        let (service, store) = service_with_store().await;
        let now = utc(2026, 8, 6, 12, 30);
        let def = definition(
            "0 * * * *",
            "UTC",
            utc(2026, 8, 1, 0, 0),
            Some(utc(2026, 8, 6, 9, 30)),
        );

        service.check_definition(&def, now).await.unwrap();

        let leased = store
            .lease_ready("schedules", now, 10, Duration::minutes(5))
            .await
            .unwrap();
        let mut reasons = Vec::new();
        for job in &leased {
            let args: ScheduleExecutionArgs = job.parse_args().unwrap();
            reasons.push((args.scheduled_for, args.reason));
        }
        reasons.sort_by_key(|(at, _)| *at);

        // 10:00 and 11:00 are more than an hour late; 12:00 is not
        assert_eq!(reasons[0].1, TriggerReason::CatchUp);
        assert_eq!(reasons[1].1, TriggerReason::CatchUp);
        assert_eq!(reasons[2].1, TriggerReason::Scheduled);
    }

    #[tokio::test]
    async fn test_invalid_timezone_falls_back_to_utc() {
        let (service, _store) = service_with_store().await;
        let now = utc(2026, 8, 6, 12, 30);
        let def = definition(
            "0 * * * *",
            "Mars/Olympus_Mons",
            utc(2026, 8, 6, 11, 30),
            Some(utc(2026, 8, 6, 11, 30)),
        );

        // Still evaluates (in UTC) instead of failing the definition
        let enqueued = service.check_definition(&def, now).await.unwrap();
        assert_eq!(enqueued, 1);
    }

    #[tokio::test]
    async fn test_malformed_cron_is_an_error_for_that_definition() {
        let (service, _store) = service_with_store().await;
        let now = utc(2026, 8, 6, 12, 30);
        let def = definition("every hour", "UTC", utc(2026, 8, 1, 0, 0), None);

        assert!(service.check_definition(&def, now).await.is_err());
    }
}
