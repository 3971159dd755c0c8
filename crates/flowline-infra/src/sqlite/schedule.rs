//! SQLite schedule repository implementation.
//!
//! `tags` is stored as a JSON array in a text column; `description` and
//! `tags` are informational only and never drive scheduling decisions.

use chrono::{DateTime, Utc};
use flowline_core::repository::ScheduleRepository;
use flowline_types::error::RepositoryError;
use flowline_types::schedule::Schedule;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid};

/// SQLite-backed implementation of `ScheduleRepository`.
pub struct SqliteScheduleRepository {
    pool: DatabasePool,
}

impl SqliteScheduleRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn fetch_all(&self, sql: &str) -> Result<Vec<Schedule>, RepositoryError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ScheduleRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            schedules.push(r.into_schedule()?);
        }
        Ok(schedules)
    }
}

// ---------------------------------------------------------------------------
// Row type
// ---------------------------------------------------------------------------

struct ScheduleRow {
    id: String,
    workflow_id: String,
    trigger_expr: String,
    enabled: bool,
    last_run_at: Option<String>,
    description: Option<String>,
    tags: String,
    created_at: String,
    updated_at: String,
}

impl ScheduleRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            trigger_expr: row.try_get("trigger_expr")?,
            enabled: row.try_get("enabled")?,
            last_run_at: row.try_get("last_run_at")?,
            description: row.try_get("description")?,
            tags: row.try_get("tags")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_schedule(self) -> Result<Schedule, RepositoryError> {
        let tags: Vec<String> = serde_json::from_str(&self.tags)
            .map_err(|e| RepositoryError::Serialization(format!("invalid tags JSON: {e}")))?;

        Ok(Schedule {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            trigger_expr: self.trigger_expr,
            enabled: self.enabled,
            last_run_at: self.last_run_at.as_deref().map(parse_datetime).transpose()?,
            description: self.description,
            tags,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// ScheduleRepository impl
// ---------------------------------------------------------------------------

impl ScheduleRepository for SqliteScheduleRepository {
    async fn create(&self, schedule: &Schedule) -> Result<(), RepositoryError> {
        let tags_json = serde_json::to_string(&schedule.tags)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO schedules
               (id, workflow_id, trigger_expr, enabled, last_run_at, description, tags,
                created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(schedule.id.to_string())
        .bind(schedule.workflow_id.to_string())
        .bind(&schedule.trigger_expr)
        .bind(schedule.enabled)
        .bind(schedule.last_run_at.as_ref().map(format_datetime))
        .bind(&schedule.description)
        .bind(&tags_json)
        .bind(format_datetime(&schedule.created_at))
        .bind(format_datetime(&schedule.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Schedule>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = ScheduleRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_schedule()?))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, schedule: &Schedule) -> Result<(), RepositoryError> {
        let tags_json = serde_json::to_string(&schedule.tags)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"UPDATE schedules SET
                 workflow_id = ?, trigger_expr = ?, enabled = ?, last_run_at = ?,
                 description = ?, tags = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(schedule.workflow_id.to_string())
        .bind(&schedule.trigger_expr)
        .bind(schedule.enabled)
        .bind(schedule.last_run_at.as_ref().map(format_datetime))
        .bind(&schedule.description)
        .bind(&tags_json)
        .bind(format_datetime(&Utc::now()))
        .bind(schedule.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Schedule>, RepositoryError> {
        self.fetch_all("SELECT * FROM schedules ORDER BY created_at ASC")
            .await
    }

    async fn list_enabled(&self) -> Result<Vec<Schedule>, RepositoryError> {
        self.fetch_all("SELECT * FROM schedules WHERE enabled = 1 ORDER BY created_at ASC")
            .await
    }

    async fn set_enabled(&self, id: &Uuid, enabled: bool) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE schedules SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn touch_last_run(&self, id: &Uuid, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE schedules SET last_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(format_datetime(&at))
            .bind(format_datetime(&at))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
