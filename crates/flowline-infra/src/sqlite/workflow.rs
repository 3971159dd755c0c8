//! SQLite workflow repository implementation.
//!
//! Steps and context are stored as JSON blobs; status is a snake_case
//! string; timestamps are RFC 3339 text. The run lock is taken with a single
//! conditional UPDATE so concurrent runners race on one statement, not on a
//! read-modify-write cycle.

use chrono::{DateTime, Utc};
use flowline_core::repository::WorkflowRepository;
use flowline_types::error::RepositoryError;
use flowline_types::workflow::{Workflow, WorkflowFilter, WorkflowStatus};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid};

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Row type
// ---------------------------------------------------------------------------

struct WorkflowRow {
    id: String,
    steps_json: String,
    current_step: i64,
    context_json: String,
    status: String,
    locked: bool,
    locked_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            steps_json: row.try_get("steps_json")?,
            current_step: row.try_get("current_step")?,
            context_json: row.try_get("context_json")?,
            status: row.try_get("status")?,
            locked: row.try_get("locked")?,
            locked_at: row.try_get("locked_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_workflow(self) -> Result<Workflow, RepositoryError> {
        let id = parse_uuid(&self.id)?;
        let steps = serde_json::from_str(&self.steps_json)
            .map_err(|e| RepositoryError::Serialization(format!("invalid steps JSON: {e}")))?;
        let context = serde_json::from_str(&self.context_json)
            .map_err(|e| RepositoryError::Serialization(format!("invalid context JSON: {e}")))?;
        let status: WorkflowStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        let locked_at = self.locked_at.as_deref().map(parse_datetime).transpose()?;

        Ok(Workflow {
            id,
            steps,
            current_step: self.current_step as u32,
            context,
            status,
            locked: self.locked,
            locked_at,
            last_error: self.last_error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let steps_json = serde_json::to_string(&workflow.steps)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        let context_json = serde_json::to_string(&workflow.context)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO workflows
               (id, steps_json, current_step, context_json, status, locked, locked_at,
                last_error, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(workflow.id.to_string())
        .bind(&steps_json)
        .bind(workflow.current_step as i64)
        .bind(&context_json)
        .bind(workflow.status.as_str())
        .bind(workflow.locked)
        .bind(workflow.locked_at.as_ref().map(format_datetime))
        .bind(&workflow.last_error)
        .bind(format_datetime(&workflow.created_at))
        .bind(format_datetime(&workflow.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = WorkflowRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_workflow()?))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let steps_json = serde_json::to_string(&workflow.steps)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        let context_json = serde_json::to_string(&workflow.context)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"UPDATE workflows SET
                 steps_json = ?, current_step = ?, context_json = ?, status = ?,
                 locked = ?, locked_at = ?, last_error = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&steps_json)
        .bind(workflow.current_step as i64)
        .bind(&context_json)
        .bind(workflow.status.as_str())
        .bind(workflow.locked)
        .bind(workflow.locked_at.as_ref().map(format_datetime))
        .bind(&workflow.last_error)
        .bind(format_datetime(&workflow.updated_at))
        .bind(workflow.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>, RepositoryError> {
        let limit = filter.limit.map(i64::from).unwrap_or(i64::MAX);
        let rows = match filter.status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM workflows WHERE status = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM workflows ORDER BY created_at DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = WorkflowRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            workflows.push(r.into_workflow()?);
        }
        Ok(workflows)
    }

    async fn try_lock(
        &self,
        id: &Uuid,
        locked_at: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflows SET locked = 1, locked_at = ?, status = 'running', updated_at = ?
               WHERE id = ? AND (locked = 0 OR locked_at IS NULL OR locked_at <= ?)"#,
        )
        .bind(format_datetime(&locked_at))
        .bind(format_datetime(&locked_at))
        .bind(id.to_string())
        .bind(format_datetime(&stale_cutoff))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn unlock(&self, id: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE workflows SET locked = 0, locked_at = NULL, updated_at = ? WHERE id = ?")
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::workflow::{Step, empty_context};
    use serde_json::json;

    async fn test_repo() -> (tempfile::TempDir, SqliteWorkflowRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("wf.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteWorkflowRepository::new(pool))
    }

    fn sample_workflow() -> Workflow {
        Workflow::new(
            vec![
                Step::new("fetch", "http", json!({ "url": "https://example.com/report" })),
                Step::new("notify", "email", json!({ "to": "ops@example.com" })),
            ],
            empty_context(),
        )
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let (_dir, repo) = test_repo().await;
        let wf = sample_workflow();
        repo.create(&wf).await.unwrap();

        let stored = repo.get(&wf.id).await.unwrap().unwrap();
        assert_eq!(stored.id, wf.id);
        assert_eq!(stored.steps.len(), 2);
        assert_eq!(stored.steps[0].step_type, "http");
        assert_eq!(stored.status, WorkflowStatus::Pending);
        assert!(!stored.locked);
        assert!(stored.locked_at.is_none());
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let (_dir, repo) = test_repo().await;
        assert!(repo.get(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_persists_progress() {
        let (_dir, repo) = test_repo().await;
        let mut wf = sample_workflow();
        repo.create(&wf).await.unwrap();

        wf.current_step = 1;
        wf.status = WorkflowStatus::Paused;
        wf.context = json!({ "step_results": { "fetch": { "rows": 9 } }, "variables": {}, "last_result": { "rows": 9 } });
        wf.last_error = None;
        repo.update(&wf).await.unwrap();

        let stored = repo.get(&wf.id).await.unwrap().unwrap();
        assert_eq!(stored.current_step, 1);
        assert_eq!(stored.status, WorkflowStatus::Paused);
        assert_eq!(stored.context["step_results"]["fetch"]["rows"], json!(9));
    }

    #[tokio::test]
    async fn update_unknown_workflow_is_not_found() {
        let (_dir, repo) = test_repo().await;
        let wf = sample_workflow();
        let err = repo.update(&wf).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn try_lock_takes_free_lock_once() {
        let (_dir, repo) = test_repo().await;
        let wf = sample_workflow();
        repo.create(&wf).await.unwrap();

        let now = Utc::now();
        let cutoff = now - chrono::Duration::minutes(5);
        assert!(repo.try_lock(&wf.id, now, cutoff).await.unwrap());

        // Second acquisition within the staleness window fails.
        let later = Utc::now();
        assert!(
            !repo
                .try_lock(&wf.id, later, later - chrono::Duration::minutes(5))
                .await
                .unwrap()
        );

        let stored = repo.get(&wf.id).await.unwrap().unwrap();
        assert!(stored.locked);
        assert_eq!(stored.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn try_lock_overrides_stale_lock() {
        let (_dir, repo) = test_repo().await;
        let mut wf = sample_workflow();
        wf.locked = true;
        wf.locked_at = Some(Utc::now() - chrono::Duration::minutes(10));
        repo.create(&wf).await.unwrap();

        let now = Utc::now();
        let acquired = repo
            .try_lock(&wf.id, now, now - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(acquired, "a 10-minute-old lock is stale and reclaimable");
    }

    #[tokio::test]
    async fn unlock_clears_lock_fields() {
        let (_dir, repo) = test_repo().await;
        let wf = sample_workflow();
        repo.create(&wf).await.unwrap();

        let now = Utc::now();
        repo.try_lock(&wf.id, now, now - chrono::Duration::minutes(5))
            .await
            .unwrap();
        repo.unlock(&wf.id).await.unwrap();

        let stored = repo.get(&wf.id).await.unwrap().unwrap();
        assert!(!stored.locked);
        assert!(stored.locked_at.is_none());
    }

    #[tokio::test]
    async fn list_filters_by_status_and_limits() {
        let (_dir, repo) = test_repo().await;
        let mut failed = sample_workflow();
        failed.status = WorkflowStatus::Failed;
        repo.create(&failed).await.unwrap();
        for _ in 0..3 {
            repo.create(&sample_workflow()).await.unwrap();
        }

        let pending = repo
            .list(&WorkflowFilter::by_status(WorkflowStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 3);

        let capped = repo
            .list(&WorkflowFilter {
                status: None,
                limit: Some(2),
            })
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);
    }
}
