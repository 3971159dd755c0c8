//! Run-to-completion driver for workflows.
//!
//! The engine advances exactly one step per `run` call; `WorkflowRunner` is
//! the job-queue-invoked entry point that loops while the workflow stays
//! `paused`, stopping at a terminal state, on lock contention (a retry
//! backoff hold -- a later queue tick will pick the workflow up again), or
//! on error. Terminal notification events are published by the engine at the
//! transition itself.

use std::sync::Arc;

use flowline_types::workflow::{Workflow, WorkflowStatus};
use futures_util::future::BoxFuture;
use uuid::Uuid;

use crate::queue::{JobFailure, JobHandler};
use crate::repository::WorkflowRepository;

use super::engine::{EngineError, WorkflowEngine};

/// Drives a workflow from its current position to a stopping point.
pub struct WorkflowRunner<R: WorkflowRepository> {
    engine: Arc<WorkflowEngine<R>>,
    repo: Arc<R>,
}

impl<R: WorkflowRepository> WorkflowRunner<R> {
    pub fn new(engine: Arc<WorkflowEngine<R>>, repo: Arc<R>) -> Self {
        Self { engine, repo }
    }

    /// Execute a workflow until it reaches a terminal state or must yield.
    ///
    /// If the workflow is already owned by a live runner (locked, and the
    /// lock is not stale), this is a skip, not an error: the workflow is
    /// returned as-is. A `running` status with no lock means a previous
    /// runner crashed after force-unlock; execution proceeds and the
    /// conditional lock arbitrates.
    pub async fn execute_by_id(&self, workflow_id: Uuid) -> Result<Workflow, EngineError> {
        let workflow = self
            .repo
            .get(&workflow_id)
            .await
            .map_err(EngineError::Repository)?
            .ok_or(EngineError::NotFound(workflow_id))?;

        if workflow.locked {
            let stale_cutoff = chrono::Utc::now() - self.engine.stale_lock_after();
            let fresh = workflow.locked_at.is_none_or(|at| at > stale_cutoff);
            if fresh {
                tracing::info!(
                    workflow_id = %workflow_id,
                    "workflow already locked by a live runner, skipping"
                );
                return Ok(workflow);
            }
        }

        let mut current = workflow;
        loop {
            match self.engine.run(workflow_id).await {
                Ok(updated) => {
                    let status = updated.status;
                    current = updated;
                    if status != WorkflowStatus::Paused {
                        break;
                    }
                }
                // A backoff hold surfaced mid-loop: the workflow is parked
                // until its lock release time; a later tick resumes it.
                Err(EngineError::LockContention(_)) => break,
                Err(err) => return Err(err),
            }
        }

        tracing::info!(
            workflow_id = %workflow_id,
            status = current.status.as_str(),
            step = current.current_step,
            "workflow run loop finished"
        );
        Ok(current)
    }
}

impl<R: WorkflowRepository> JobHandler for WorkflowRunner<R> {
    fn run_task(&self, task_id: Uuid) -> BoxFuture<'_, Result<(), JobFailure>> {
        Box::pin(async move {
            // A workflow that is already terminal makes the job an
            // idempotent no-op, not a failure.
            if let Ok(Some(existing)) = self.repo.get(&task_id).await
                && existing.status.is_terminal()
            {
                tracing::debug!(workflow_id = %task_id, "workflow already terminal, job is a no-op");
                return Ok(());
            }

            let workflow = self
                .execute_by_id(task_id)
                .await
                .map_err(|e| JobFailure(e.to_string()))?;

            if workflow.status == WorkflowStatus::Failed {
                return Err(JobFailure(
                    workflow
                        .last_error
                        .unwrap_or_else(|| "workflow failed".to_string()),
                ));
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
