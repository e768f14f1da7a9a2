//! SQLite-backed job store
//!
//! The partial unique index on (kind, unique_key) over non-discarded rows
//! is the whole multi-instance safety story: N concurrent schedulers can
//! race on the same due occurrence and exactly one insert wins.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;
use uuid::Uuid;

use super::{fmt_ts, parse_opt_ts, parse_ts};
use crate::jobs::store::{EnqueueResult, JobStore, NewJob, QueueCounts, StoreError};
use crate::jobs::types::{Job, JobKind, JobPriority};
use crate::models::JobState;

#[derive(Clone)]
pub struct SqliteJobStore {
    pool: Pool<Sqlite>,
}

impl SqliteJobStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

const JOB_COLUMNS: &str = "id, kind, args, queue, priority, attempt, max_attempts, unique_key, \
     scheduled_at, state, leased_until, last_error, created_at, attempted_at";

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let id: String = row.get("id");
    let kind: String = row.get("kind");
    let args: String = row.get("args");
    let scheduled_at: String = row.get("scheduled_at");
    let state: String = row.get("state");
    let leased_until: Option<String> = row.get("leased_until");
    let created_at: String = row.get("created_at");
    let attempted_at: Option<String> = row.get("attempted_at");

    Ok(Job {
        id: Uuid::parse_str(&id)?,
        kind: kind
            .parse::<JobKind>()
            .map_err(|e| anyhow::anyhow!("{e}"))?,
        args: serde_json::from_str(&args)?,
        queue: row.get("queue"),
        priority: JobPriority::from_i64(row.get("priority")),
        attempt: row.get("attempt"),
        max_attempts: row.get("max_attempts"),
        unique_key: row.get("unique_key"),
        scheduled_at: parse_ts(&scheduled_at)?,
        state: JobState::parse(&state)
            .ok_or_else(|| anyhow::anyhow!("Unknown job state: {}", state))?,
        leased_until: parse_opt_ts(leased_until)?,
        last_error: row.get("last_error"),
        created_at: parse_ts(&created_at)?,
        attempted_at: parse_opt_ts(attempted_at)?,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<EnqueueResult, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let scheduled_at = new_job.scheduled_at.unwrap_or(now);

        // INSERT OR IGNORE defers to the partial unique dedup index; a
        // conflict means another producer already enqueued this unit
        let result = sqlx::query(
            "INSERT OR IGNORE INTO jobs \
             (id, kind, args, queue, priority, max_attempts, unique_key, scheduled_at, \
              state, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'available', ?)",
        )
        .bind(id.to_string())
        .bind(new_job.kind.as_str())
        .bind(new_job.args.to_string())
        .bind(new_job.kind.queue())
        .bind(new_job.priority.as_i64())
        .bind(new_job.max_attempts)
        .bind(&new_job.unique_key)
        .bind(fmt_ts(scheduled_at))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        if result.rows_affected() == 0 {
            debug!(
                "Skipping duplicate job for key: {}",
                new_job.unique_key.as_deref().unwrap_or("<none>")
            );
            return Ok(EnqueueResult::Duplicate);
        }

        let job = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::Database {
                source: anyhow::anyhow!("job {} vanished after insert", id),
            })?;
        Ok(EnqueueResult::Enqueued(job))
    }

    async fn lease_ready(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let candidates: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM jobs \
             WHERE queue = ? AND state IN ('available', 'retryable') AND scheduled_at <= ? \
             ORDER BY priority ASC, scheduled_at ASC LIMIT ?",
        )
        .bind(queue)
        .bind(fmt_ts(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        let mut leased = Vec::new();
        for id in candidates {
            // Conditional update keeps the claim atomic per row, so
            // concurrent instances cannot lease the same job twice
            let claimed = sqlx::query(
                "UPDATE jobs SET state = 'running', attempt = attempt + 1, \
                 attempted_at = ?, leased_until = ? \
                 WHERE id = ? AND state IN ('available', 'retryable')",
            )
            .bind(fmt_ts(now))
            .bind(fmt_ts(now + lease))
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;

            if claimed.rows_affected() == 0 {
                continue;
            }
            let job_id = Uuid::parse_str(&id).map_err(anyhow::Error::from)?;
            if let Some(job) = self.get(job_id).await? {
                leased.push(job);
            }
        }

        if !leased.is_empty() {
            debug!("Leased {} jobs from queue '{}'", leased.len(), queue);
        }
        Ok(leased)
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'completed', leased_until = NULL WHERE id = ?",
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { id: job_id });
        }
        Ok(())
    }

    async fn retry(
        &self,
        job_id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'retryable', scheduled_at = ?, leased_until = NULL, \
             last_error = ? WHERE id = ?",
        )
        .bind(fmt_ts(next_attempt_at))
        .bind(error)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { id: job_id });
        }
        Ok(())
    }

    async fn discard(&self, job_id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'discarded', leased_until = NULL, last_error = ? \
             WHERE id = ?",
        )
        .bind(error)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { id: job_id });
        }
        Ok(())
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let now_text = fmt_ts(now);

        let discarded = sqlx::query(
            "UPDATE jobs SET state = 'discarded', leased_until = NULL, \
             last_error = 'lease expired; attempts exhausted' \
             WHERE state = 'running' AND leased_until < ? AND attempt >= max_attempts",
        )
        .bind(&now_text)
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        let requeued = sqlx::query(
            "UPDATE jobs SET state = 'retryable', scheduled_at = ?, leased_until = NULL, \
             last_error = 'lease expired' \
             WHERE state = 'running' AND leased_until < ?",
        )
        .bind(&now_text)
        .bind(&now_text)
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        Ok((discarded.rows_affected() + requeued.rows_affected()) as usize)
    }

    async fn prune_finished(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE state IN ('completed', 'discarded') AND created_at < ?",
        )
        .bind(fmt_ts(cutoff))
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(result.rows_affected() as usize)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, StoreError> {
        let available: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE queue = ? AND state IN ('available', 'retryable')",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        let running: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ? AND state = 'running'")
                .bind(queue)
                .fetch_one(&self.pool)
                .await
                .map_err(anyhow::Error::from)?;

        Ok(QueueCounts {
            available: available as usize,
            running: running as usize,
        })
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;

        row.as_ref()
            .map(job_from_row)
            .transpose()
            .map_err(StoreError::from)
    }
}
