//! Series definition and instance queries
//!
//! Instance uniqueness and the watermark guard live here: idempotence of
//! re-expansion is a storage-level property, not an in-process lock.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;
use std::collections::HashSet;
use uuid::Uuid;

use super::{fmt_date, fmt_opt_ts, fmt_ts, parse_date, parse_opt_ts, parse_ts, Database};
use crate::models::{SeriesDefinition, SeriesInstance, SeriesStatus};

const SERIES_COLUMNS: &str = "id, name, owner_email, recurrence_rule, dtstart, duration, \
     timezone, entity_table, entity_template, time_range_column, expanded_until, status, \
     status_reason, created_at, updated_at";

fn series_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SeriesDefinition> {
    let id: String = row.get("id");
    let dtstart: String = row.get("dtstart");
    let entity_template: String = row.get("entity_template");
    let expanded_until: Option<String> = row.get("expanded_until");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(SeriesDefinition {
        id: Uuid::parse_str(&id)?,
        name: row.get("name"),
        owner_email: row.get("owner_email"),
        recurrence_rule: row.get("recurrence_rule"),
        dtstart: parse_ts(&dtstart)?,
        duration: row.get("duration"),
        timezone: row.get("timezone"),
        entity_table: row.get("entity_table"),
        entity_template: serde_json::from_str(&entity_template)?,
        time_range_column: row.get("time_range_column"),
        expanded_until: parse_opt_ts(expanded_until)?,
        status: SeriesStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("Unknown series status: {}", status))?,
        status_reason: row.get("status_reason"),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

impl Database {
    pub async fn insert_series(&self, series: &SeriesDefinition) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO series_definitions ({SERIES_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(series.id.to_string())
        .bind(&series.name)
        .bind(&series.owner_email)
        .bind(&series.recurrence_rule)
        .bind(fmt_ts(series.dtstart))
        .bind(&series.duration)
        .bind(&series.timezone)
        .bind(&series.entity_table)
        .bind(serde_json::to_string(&series.entity_template)?)
        .bind(&series.time_range_column)
        .bind(fmt_opt_ts(series.expanded_until))
        .bind(series.status.as_str())
        .bind(&series.status_reason)
        .bind(fmt_ts(series.created_at))
        .bind(fmt_ts(series.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_series(&self, id: Uuid) -> Result<Option<SeriesDefinition>> {
        let row = sqlx::query(&format!(
            "SELECT {SERIES_COLUMNS} FROM series_definitions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(series_from_row).transpose()
    }

    /// Active series whose watermark lags the expansion horizon
    pub async fn list_series_needing_expansion(
        &self,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<SeriesDefinition>> {
        let rows = sqlx::query(&format!(
            "SELECT {SERIES_COLUMNS} FROM series_definitions \
             WHERE status = 'active' AND (expanded_until IS NULL OR expanded_until < ?) \
             ORDER BY name"
        ))
        .bind(fmt_ts(horizon))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(series_from_row).collect()
    }

    pub async fn set_series_status(
        &self,
        id: Uuid,
        status: SeriesStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE series_definitions SET status = ?, status_reason = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Advance the expansion watermark; it is monotonic, so overlapping
    /// or out-of-order expansion jobs can never pull it backwards
    pub async fn advance_series_watermark(
        &self,
        id: Uuid,
        expanded_until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE series_definitions SET expanded_until = ?, updated_at = ? \
             WHERE id = ? AND (expanded_until IS NULL OR expanded_until < ?)",
        )
        .bind(fmt_ts(expanded_until))
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .bind(fmt_ts(expanded_until))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Occurrence dates already materialized for a series
    pub async fn existing_instance_dates(&self, series_id: Uuid) -> Result<HashSet<NaiveDate>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT occurrence_date FROM series_instances WHERE series_id = ?")
                .bind(series_id.to_string())
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(|value| parse_date(value)).collect()
    }

    /// Record one occurrence; returns false when the (series, date) pair
    /// already exists
    pub async fn insert_series_instance(
        &self,
        series_id: Uuid,
        occurrence_date: NaiveDate,
        entity_id: Option<i64>,
        exception_type: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO series_instances \
             (id, series_id, occurrence_date, entity_id, is_exception, exception_type, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(series_id.to_string())
        .bind(fmt_date(occurrence_date))
        .bind(entity_id)
        .bind(exception_type.is_some())
        .bind(exception_type)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_series_instances(&self, series_id: Uuid) -> Result<Vec<SeriesInstance>> {
        let rows = sqlx::query(
            "SELECT id, series_id, occurrence_date, entity_id, is_exception, exception_type, \
             created_at FROM series_instances WHERE series_id = ? ORDER BY occurrence_date",
        )
        .bind(series_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut instances = Vec::new();
        for row in rows {
            let id: String = row.get("id");
            let series_id: String = row.get("series_id");
            let occurrence_date: String = row.get("occurrence_date");
            let created_at: String = row.get("created_at");

            instances.push(SeriesInstance {
                id: Uuid::parse_str(&id)?,
                series_id: Uuid::parse_str(&series_id)?,
                occurrence_date: parse_date(&occurrence_date)?,
                entity_id: row.get("entity_id"),
                is_exception: row.get("is_exception"),
                exception_type: row.get("exception_type"),
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(instances)
    }
}
