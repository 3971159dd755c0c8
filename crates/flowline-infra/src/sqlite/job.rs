//! SQLite job repository implementation.

use chrono::{DateTime, Utc};
use flowline_core::repository::JobRepository;
use flowline_types::error::RepositoryError;
use flowline_types::job::{Job, JobStatus};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid};

/// SQLite-backed implementation of `JobRepository`.
pub struct SqliteJobRepository {
    pool: DatabasePool,
}

impl SqliteJobRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Row type
// ---------------------------------------------------------------------------

struct JobRow {
    id: String,
    task_id: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    last_error: Option<String>,
    next_run_at: String,
    last_run_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            last_error: row.try_get("last_error")?,
            next_run_at: row.try_get("next_run_at")?,
            last_run_at: row.try_get("last_run_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_job(self) -> Result<Job, RepositoryError> {
        let status: JobStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;

        Ok(Job {
            id: parse_uuid(&self.id)?,
            task_id: parse_uuid(&self.task_id)?,
            status,
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts as u32,
            last_error: self.last_error,
            next_run_at: parse_datetime(&self.next_run_at)?,
            last_run_at: self.last_run_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// JobRepository impl
// ---------------------------------------------------------------------------

impl JobRepository for SqliteJobRepository {
    async fn create(&self, job: &Job) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO jobs
               (id, task_id, status, attempts, max_attempts, last_error,
                next_run_at, last_run_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(job.id.to_string())
        .bind(job.task_id.to_string())
        .bind(job.status.as_str())
        .bind(job.attempts as i64)
        .bind(job.max_attempts as i64)
        .bind(&job.last_error)
        .bind(format_datetime(&job.next_run_at))
        .bind(job.last_run_at.as_ref().map(format_datetime))
        .bind(format_datetime(&job.created_at))
        .bind(format_datetime(&job.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = JobRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_job()?))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, job: &Job) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE jobs SET
                 task_id = ?, status = ?, attempts = ?, max_attempts = ?, last_error = ?,
                 next_run_at = ?, last_run_at = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(job.task_id.to_string())
        .bind(job.status.as_str())
        .bind(job.attempts as i64)
        .bind(job.max_attempts as i64)
        .bind(&job.last_error)
        .bind(format_datetime(&job.next_run_at))
        .bind(job.last_run_at.as_ref().map(format_datetime))
        .bind(format_datetime(&job.updated_at))
        .bind(job.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM jobs
               WHERE status = 'pending' AND next_run_at <= ?
               ORDER BY next_run_at ASC
               LIMIT ?"#,
        )
        .bind(format_datetime(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = JobRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            jobs.push(r.into_job()?);
        }
        Ok(jobs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
