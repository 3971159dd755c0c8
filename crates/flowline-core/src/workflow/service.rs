//! Workflow CRUD surface consumed by surrounding layers.
//!
//! `WorkflowService` owns creation-time validation (non-empty step list,
//! every step type routable through the registry) so that structurally
//! broken workflows are rejected before anything is persisted, not
//! discovered mid-run.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use flowline_types::workflow::{Step, Workflow, WorkflowFilter, WorkflowStatus};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::WorkflowRepository;

use super::context::WorkflowContext;
use super::engine::{EngineError, WorkflowEngine};
use super::handler::StepHandlerRegistry;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the workflow CRUD surface.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    /// The workflow is currently owned by a runner.
    #[error("workflow {0} is locked")]
    Locked(Uuid),

    #[error("repository error: {0}")]
    Repository(#[from] flowline_types::error::RepositoryError),
}

// ---------------------------------------------------------------------------
// WorkflowService
// ---------------------------------------------------------------------------

/// The workflow API surface consumed by surrounding layers: CRUD plus a
/// single-step run delegated to the engine.
pub struct WorkflowService<R: WorkflowRepository> {
    repo: Arc<R>,
    registry: Arc<StepHandlerRegistry>,
    engine: Arc<WorkflowEngine<R>>,
}

impl<R: WorkflowRepository> WorkflowService<R> {
    pub fn new(
        repo: Arc<R>,
        registry: Arc<StepHandlerRegistry>,
        engine: Arc<WorkflowEngine<R>>,
    ) -> Self {
        Self {
            repo,
            registry,
            engine,
        }
    }

    /// Execute one step of the workflow. See [`WorkflowEngine::run`].
    pub async fn run_workflow(&self, id: Uuid) -> Result<Workflow, EngineError> {
        self.engine.run(id).await
    }

    /// Create and persist a workflow from an ordered step list and seed
    /// variables.
    ///
    /// Rejects an empty step list and any step type with no registered
    /// handler; duplicate step IDs are rejected too since the context keys
    /// results by step id.
    pub async fn create_workflow(
        &self,
        steps: Vec<Step>,
        variables: HashMap<String, Value>,
    ) -> Result<Workflow, ServiceError> {
        if steps.is_empty() {
            return Err(ServiceError::Validation(
                "workflow must have at least one step".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for step in &steps {
            if !seen.insert(step.id.as_str()) {
                return Err(ServiceError::Validation(format!(
                    "duplicate step id: '{}'",
                    step.id
                )));
            }
        }

        self.registry
            .ensure_routable(steps.iter().map(|s| s.step_type.as_str()))
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

        let context = WorkflowContext::with_variables(variables);
        let workflow = Workflow::new(steps, context.to_json());
        self.repo.create(&workflow).await?;

        tracing::info!(
            workflow_id = %workflow.id,
            steps = workflow.steps.len(),
            "workflow created"
        );
        Ok(workflow)
    }

    /// Fetch a workflow by ID.
    pub async fn get_workflow(&self, id: Uuid) -> Result<Workflow, ServiceError> {
        self.repo
            .get(&id)
            .await?
            .ok_or(ServiceError::NotFound(id))
    }

    /// List workflows matching the filter, newest first.
    pub async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<Workflow>, ServiceError> {
        Ok(self.repo.list(filter).await?)
    }

    /// Rewind a workflow to its initial state: step zero, fresh retry
    /// budgets, accumulated results discarded (seed variables survive).
    ///
    /// Refused while a runner holds the lock.
    pub async fn reset_workflow(&self, id: Uuid) -> Result<Workflow, ServiceError> {
        let mut workflow = self.get_workflow(id).await?;
        if workflow.locked {
            return Err(ServiceError::Locked(id));
        }

        for step in &mut workflow.steps {
            step.retries = 0;
        }
        let mut context = WorkflowContext::from_json(workflow.context.clone())
            .unwrap_or_default();
        context.clear_results();

        workflow.current_step = 0;
        workflow.context = context.to_json();
        workflow.status = WorkflowStatus::Pending;
        workflow.last_error = None;
        workflow.updated_at = Utc::now();
        self.repo.update(&workflow).await?;

        tracing::info!(workflow_id = %id, "workflow reset");
        Ok(workflow)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::testing::{MemoryWorkflowRepository, RecordingHandler};
    use flowline_types::config::EngineConfig;
    use serde_json::json;

    fn service_with(
        step_types: &[&str],
    ) -> (Arc<MemoryWorkflowRepository>, WorkflowService<MemoryWorkflowRepository>) {
        let mut registry = StepHandlerRegistry::new();
        for step_type in step_types {
            registry
                .register(*step_type, RecordingHandler::returning(json!("ok")))
                .unwrap();
        }
        let registry = Arc::new(registry);
        let repo = Arc::new(MemoryWorkflowRepository::new());
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&repo),
            Arc::clone(&registry),
            EventBus::new(16),
            &EngineConfig::default(),
        ));
        let service = WorkflowService::new(Arc::clone(&repo), registry, engine);
        (repo, service)
    }

    #[tokio::test]
    async fn create_persists_a_pending_workflow() {
        let (repo, service) = service_with(&["fetch"]);
        let wf = service
            .create_workflow(
                vec![Step::new("a", "fetch", json!({}))],
                HashMap::from([("region".to_string(), json!("us-east-1"))]),
            )
            .await
            .unwrap();

        let stored = repo.get(&wf.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Pending);
        let ctx = WorkflowContext::from_json(stored.context).unwrap();
        assert_eq!(ctx.variables.get("region"), Some(&json!("us-east-1")));
    }

    #[tokio::test]
    async fn create_rejects_empty_step_list() {
        let (_, service) = service_with(&["fetch"]);
        let err = service
            .create_workflow(vec![], HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn create_rejects_unknown_step_type() {
        let (_, service) = service_with(&["fetch"]);
        let err = service
            .create_workflow(
                vec![Step::new("a", "teleport", json!({}))],
                HashMap::new(),
            )
            .await
            .unwrap_err();
        match err {
            ServiceError::Validation(msg) => assert!(msg.contains("teleport")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_step_ids() {
        let (_, service) = service_with(&["fetch"]);
        let err = service
            .create_workflow(
                vec![
                    Step::new("a", "fetch", json!({})),
                    Step::new("a", "fetch", json!({})),
                ],
                HashMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let (_, service) = service_with(&["fetch"]);
        service
            .create_workflow(vec![Step::new("a", "fetch", json!({}))], HashMap::new())
            .await
            .unwrap();

        let pending = service
            .list_workflows(&WorkflowFilter::by_status(WorkflowStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        let failed = service
            .list_workflows(&WorkflowFilter::by_status(WorkflowStatus::Failed))
            .await
            .unwrap();
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn reset_rewinds_a_completed_workflow() {
        let (_, service) = service_with(&["fetch"]);

        let wf = service
            .create_workflow(
                vec![Step::new("a", "fetch", json!({}))],
                HashMap::from([("keep".to_string(), json!(true))]),
            )
            .await
            .unwrap();
        let done = service.run_workflow(wf.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);

        let reset = service.reset_workflow(wf.id).await.unwrap();
        assert_eq!(reset.status, WorkflowStatus::Pending);
        assert_eq!(reset.current_step, 0);
        assert!(reset.last_error.is_none());
        let ctx = WorkflowContext::from_json(reset.context).unwrap();
        assert!(ctx.step_results.is_empty());
        assert_eq!(ctx.variables.get("keep"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn reset_refused_while_locked() {
        let (repo, service) = service_with(&["fetch"]);
        let wf = service
            .create_workflow(vec![Step::new("a", "fetch", json!({}))], HashMap::new())
            .await
            .unwrap();
        repo.set_lock(&wf.id, true, Some(Utc::now()));

        let err = service.reset_workflow(wf.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Locked(id) if id == wf.id));
    }

    #[tokio::test]
    async fn get_unknown_workflow_is_not_found() {
        let (_, service) = service_with(&["fetch"]);
        let err = service.get_workflow(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
