//! Schedule definition and run-history queries

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use super::{fmt_ts, parse_opt_ts, parse_ts, Database};
use crate::models::{ScheduleDefinition, ScheduleRun, TriggerReason};

fn definition_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ScheduleDefinition> {
    let id: String = row.get("id");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let last_run_at: Option<String> = row.get("last_run_at");

    Ok(ScheduleDefinition {
        id: Uuid::parse_str(&id)?,
        name: row.get("name"),
        target: row.get("target"),
        cron_expression: row.get("cron_expression"),
        timezone: row.get("timezone"),
        enabled: row.get("enabled"),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        last_run_at: parse_opt_ts(last_run_at)?,
    })
}

const DEFINITION_COLUMNS: &str = "id, name, target, cron_expression, timezone, enabled, \
     created_at, updated_at, last_run_at";

impl Database {
    pub async fn list_enabled_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM schedule_definitions WHERE enabled = 1 ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(definition_from_row).collect()
    }

    pub async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduleDefinition>> {
        let row = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM schedule_definitions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(definition_from_row).transpose()
    }

    /// Insert an operator-defined schedule if no schedule with the same
    /// name exists yet; built-in schedules are seeded through this
    pub async fn ensure_schedule(
        &self,
        name: &str,
        target: &str,
        cron_expression: &str,
        timezone: &str,
    ) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let result = sqlx::query(
            "INSERT OR IGNORE INTO schedule_definitions \
             (id, name, target, cron_expression, timezone, enabled, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .bind(target)
        .bind(cron_expression)
        .bind(timezone)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!("Seeded schedule definition '{}'", name);
        }
        Ok(())
    }

    /// Advance a schedule's last-run marker; it never moves backwards,
    /// so out-of-order catch-up completions are safe
    pub async fn advance_schedule_last_run(&self, id: Uuid, ran_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE schedule_definitions SET last_run_at = ?, updated_at = ? \
             WHERE id = ? AND (last_run_at IS NULL OR last_run_at < ?)",
        )
        .bind(fmt_ts(ran_at))
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .bind(fmt_ts(ran_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record the start of one execution attempt
    pub async fn insert_schedule_run(
        &self,
        schedule_id: Uuid,
        scheduled_for: DateTime<Utc>,
        reason: TriggerReason,
        started_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO schedule_runs \
             (id, schedule_id, scheduled_for, trigger_reason, started_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run_id.to_string())
        .bind(schedule_id.to_string())
        .bind(fmt_ts(scheduled_for))
        .bind(reason.as_str())
        .bind(fmt_ts(started_at))
        .execute(&self.pool)
        .await?;
        Ok(run_id)
    }

    /// Complete an execution attempt; runs are append-only afterwards
    pub async fn complete_schedule_run(
        &self,
        run_id: Uuid,
        success: bool,
        message: &str,
        completed_at: DateTime<Utc>,
        duration_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE schedule_runs SET completed_at = ?, duration_ms = ?, success = ?, message = ? \
             WHERE id = ? AND completed_at IS NULL",
        )
        .bind(fmt_ts(completed_at))
        .bind(duration_ms)
        .bind(success)
        .bind(message)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_schedule_runs(
        &self,
        schedule_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ScheduleRun>> {
        let rows = sqlx::query(
            "SELECT id, schedule_id, scheduled_for, trigger_reason, started_at, \
             completed_at, duration_ms, success, message \
             FROM schedule_runs WHERE schedule_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(schedule_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut runs = Vec::new();
        for row in rows {
            let id: String = row.get("id");
            let schedule_id: String = row.get("schedule_id");
            let scheduled_for: String = row.get("scheduled_for");
            let trigger_reason: String = row.get("trigger_reason");
            let started_at: String = row.get("started_at");
            let completed_at: Option<String> = row.get("completed_at");

            runs.push(ScheduleRun {
                id: Uuid::parse_str(&id)?,
                schedule_id: Uuid::parse_str(&schedule_id)?,
                scheduled_for: parse_ts(&scheduled_for)?,
                trigger_reason: TriggerReason::parse(&trigger_reason).unwrap_or(
                    TriggerReason::Scheduled,
                ),
                started_at: parse_ts(&started_at)?,
                completed_at: parse_opt_ts(completed_at)?,
                duration_ms: row.get("duration_ms"),
                success: row.get("success"),
                message: row.get("message"),
            });
        }
        Ok(runs)
    }

    /// Prune completed run history older than the cutoff
    pub async fn prune_schedule_runs(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM schedule_runs WHERE completed_at IS NOT NULL AND started_at < ?",
        )
        .bind(fmt_ts(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn test_database() -> Database {
        let database = Database::new_in_memory().await.unwrap();
        database.migrate().await.unwrap();
        database
    }

    #[tokio::test]
    async fn test_ensure_schedule_is_idempotent() {
        let database = test_database().await;

        database
            .ensure_schedule("history-cleanup", "history-cleanup", "0 3 * * *", "UTC")
            .await
            .unwrap();
        database
            .ensure_schedule("history-cleanup", "history-cleanup", "0 4 * * *", "UTC")
            .await
            .unwrap();

        let schedules = database.list_enabled_schedules().await.unwrap();
        assert_eq!(schedules.len(), 1);
        // The original definition wins
        assert_eq!(schedules[0].cron_expression, "0 3 * * *");
    }

    #[tokio::test]
    async fn test_last_run_never_regresses() {
        let database = test_database().await;
        database
            .ensure_schedule("sweep", "series-expansion-sweep", "0 * * * *", "UTC")
            .await
            .unwrap();
        let schedule = database.list_enabled_schedules().await.unwrap().remove(0);

        let newer = Utc::now();
        let older = newer - Duration::hours(2);

        database
            .advance_schedule_last_run(schedule.id, newer)
            .await
            .unwrap();
        database
            .advance_schedule_last_run(schedule.id, older)
            .await
            .unwrap();

        let reloaded = database.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(
            reloaded.last_run_at.unwrap().timestamp_micros(),
            newer.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn test_run_history_records_attempts() {
        let database = test_database().await;
        database
            .ensure_schedule("sweep", "series-expansion-sweep", "0 * * * *", "UTC")
            .await
            .unwrap();
        let schedule = database.list_enabled_schedules().await.unwrap().remove(0);

        let scheduled_for = Utc::now() - Duration::minutes(5);
        let started = Utc::now();
        let run_id = database
            .insert_schedule_run(schedule.id, scheduled_for, TriggerReason::CatchUp, started)
            .await
            .unwrap();
        database
            .complete_schedule_run(run_id, true, "enqueued 3 jobs", started, 42)
            .await
            .unwrap();

        let runs = database.list_schedule_runs(schedule.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger_reason, TriggerReason::CatchUp);
        assert_eq!(runs[0].success, Some(true));
        assert_eq!(runs[0].duration_ms, Some(42));
        assert_eq!(runs[0].message.as_deref(), Some("enqueued 3 jobs"));
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_runs() {
        let database = test_database().await;
        database
            .ensure_schedule("sweep", "series-expansion-sweep", "0 * * * *", "UTC")
            .await
            .unwrap();
        let schedule = database.list_enabled_schedules().await.unwrap().remove(0);

        let old_start = Utc::now() - Duration::days(30);
        let run_id = database
            .insert_schedule_run(schedule.id, old_start, TriggerReason::Scheduled, old_start)
            .await
            .unwrap();
        database
            .complete_schedule_run(run_id, true, "ok", old_start, 1)
            .await
            .unwrap();

        let recent = Utc::now();
        let recent_id = database
            .insert_schedule_run(schedule.id, recent, TriggerReason::Scheduled, recent)
            .await
            .unwrap();
        database
            .complete_schedule_run(recent_id, true, "ok", recent, 1)
            .await
            .unwrap();

        let pruned = database
            .prune_schedule_runs(Utc::now() - Duration::days(14))
            .await
            .unwrap();
        assert_eq!(pruned, 1);

        let runs = database.list_schedule_runs(schedule.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, recent_id);
    }
}
