//! Templated entity materialization for recurrence series
//!
//! A series names a target table, a field template and a time-range
//! column prefix. Occurrences become rows in that table with
//! `{column}_start`/`{column}_end` timestamps, and the overlap rule is
//! enforced by an atomic guarded insert so concurrent expansion jobs
//! cannot double-book a range.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::debug;

use super::{fmt_ts, Database};
use crate::errors::RepositoryError;

/// One live column of a target table
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
}

/// Result of a guarded entity insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityInsert {
    /// Row created with this rowid
    Inserted(i64),
    /// The time range overlaps an existing row; nothing was written
    OverlapConflict,
}

/// Identifiers are interpolated into SQL, so only plain names pass
fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn checked_identifier(name: &str) -> Result<&str, RepositoryError> {
    if is_safe_identifier(name) {
        Ok(name)
    } else {
        Err(RepositoryError::InvalidIdentifier {
            identifier: name.to_string(),
        })
    }
}

/// Loose compatibility between a template JSON value and a declared
/// SQLite column type; untyped columns accept anything
fn value_compatible(value: &serde_json::Value, declared_type: &str) -> bool {
    let declared = declared_type.to_uppercase();
    if declared.is_empty() {
        return true;
    }
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Bool(_) => declared.contains("BOOL") || declared.contains("INT"),
        serde_json::Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                declared.contains("INT")
                    || declared.contains("REAL")
                    || declared.contains("NUMERIC")
                    || declared.contains("DECIMAL")
            } else {
                declared.contains("REAL")
                    || declared.contains("FLOAT")
                    || declared.contains("DOUBLE")
                    || declared.contains("NUMERIC")
            }
        }
        serde_json::Value::String(_) => {
            declared.contains("TEXT")
                || declared.contains("CHAR")
                || declared.contains("CLOB")
                || declared.contains("DATE")
                || declared.contains("TIME")
        }
        // Arrays and objects are stored as JSON text
        _ => declared.contains("TEXT") || declared.contains("JSON"),
    }
}

fn bind_json_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &serde_json::Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        serde_json::Value::Null => query.bind(Option::<String>::None),
        serde_json::Value::Bool(b) => query.bind(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

impl Database {
    /// Live columns of a table; empty when the table does not exist
    pub async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let table = checked_identifier(table)?;
        let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| ColumnInfo {
                name: row.get("name"),
                declared_type: row.get("type"),
                not_null: row.get::<i64, _>("notnull") != 0,
            })
            .collect())
    }

    /// Validate a series template against the live target table
    ///
    /// Returns the list of drift findings; an empty list means the
    /// template still matches the schema.
    pub async fn validate_entity_template(
        &self,
        table: &str,
        template: &serde_json::Map<String, serde_json::Value>,
        time_range_column: &str,
    ) -> Result<Vec<String>> {
        let mut findings = Vec::new();

        if checked_identifier(table).is_err() {
            return Ok(vec![format!("entity table name '{table}' is not a valid identifier")]);
        }
        if checked_identifier(time_range_column).is_err() {
            return Ok(vec![format!(
                "time range column '{time_range_column}' is not a valid identifier"
            )]);
        }

        let columns = self.table_columns(table).await?;
        if columns.is_empty() {
            return Ok(vec![format!("entity table '{table}' does not exist")]);
        }

        for (field, value) in template {
            if checked_identifier(field).is_err() {
                findings.push(format!("template field '{field}' is not a valid identifier"));
                continue;
            }
            match columns.iter().find(|c| c.name == *field) {
                None => findings.push(format!(
                    "template field '{field}' has no column in '{table}'"
                )),
                Some(column) => {
                    if !value_compatible(value, &column.declared_type) {
                        findings.push(format!(
                            "template field '{field}' is incompatible with column type '{}'",
                            column.declared_type
                        ));
                    }
                    if column.not_null && value.is_null() {
                        findings.push(format!(
                            "template field '{field}' is null but column is NOT NULL"
                        ));
                    }
                }
            }
        }

        for suffix in ["start", "end"] {
            let range_field = format!("{time_range_column}_{suffix}");
            if !columns.iter().any(|c| c.name == range_field) {
                findings.push(format!(
                    "time range column '{range_field}' is missing from '{table}'"
                ));
            }
        }

        // Required columns the template never mentions would fail every
        // insert, which is drift too
        for column in &columns {
            let is_range = column.name == format!("{time_range_column}_start")
                || column.name == format!("{time_range_column}_end");
            if column.not_null && !is_range && !template.contains_key(&column.name) {
                findings.push(format!(
                    "column '{}' is NOT NULL but absent from the template",
                    column.name
                ));
            }
        }

        Ok(findings)
    }

    /// Insert a templated entity row unless its time range overlaps an
    /// existing row in the same table
    pub async fn insert_templated_entity(
        &self,
        table: &str,
        template: &serde_json::Map<String, serde_json::Value>,
        time_range_column: &str,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<EntityInsert> {
        let table = checked_identifier(table)?;
        let range = checked_identifier(time_range_column)?;

        let mut columns: Vec<&str> = Vec::new();
        for field in template.keys() {
            columns.push(checked_identifier(field)?);
        }

        let mut column_list: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        column_list.push(format!("{range}_start"));
        column_list.push(format!("{range}_end"));
        let placeholders = vec!["?"; column_list.len()].join(", ");

        // Single-statement guarded insert: the overlap check and the
        // write happen atomically inside SQLite
        let sql = format!(
            "INSERT INTO {table} ({}) SELECT {placeholders} \
             WHERE NOT EXISTS (SELECT 1 FROM {table} \
             WHERE {range}_start < ? AND {range}_end > ?)",
            column_list.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for value in template.values() {
            query = bind_json_value(query, value);
        }
        let start_text = fmt_ts(range_start);
        let end_text = fmt_ts(range_end);
        query = query
            .bind(start_text.clone())
            .bind(end_text.clone())
            .bind(end_text)
            .bind(start_text);

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            debug!(
                "Overlap conflict on {}.{}_start/{}_end",
                table, range, range
            );
            return Ok(EntityInsert::OverlapConflict);
        }
        Ok(EntityInsert::Inserted(result.last_insert_rowid()))
    }
}
