//! One-step workflow engine with optimistic conditional locking.
//!
//! `run` loads a workflow, takes the run lock through a single conditional
//! update, executes exactly one step through the handler registry, persists
//! the advanced record, and releases the lock. Callers loop on `paused` to
//! drive a workflow to completion; the loop lives in
//! [`super::runner::WorkflowRunner`], not here.
//!
//! # Locking
//!
//! The lock is a `(locked, locked_at)` pair on the workflow row, taken with
//! a compare-and-set style conditional update rather than a transaction
//! spanning the step. A lock older than the staleness threshold may be
//! overridden by a new runner; this bounds how long a crashed holder can
//! wedge a workflow, at the documented cost that a merely-slow holder can be
//! double-run. Retry backoff reuses the same mechanism: after a retryable
//! step failure the lock is kept and `locked_at` is dated so that
//! `locked_at + staleness` -- the only reclaim path -- lands exactly at the
//! intended retry-eligible time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowline_types::config::EngineConfig;
use flowline_types::event::OrchestratorEvent;
use flowline_types::workflow::{Workflow, WorkflowStatus};
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::WorkflowRepository;

use super::context::{ContextError, WorkflowContext};
use super::handler::StepHandlerRegistry;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the engine. Step failures are not errors -- they are
/// recorded on the returned workflow.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No workflow with the given ID.
    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    /// The workflow is locked by another runner (and the lock is not stale).
    #[error("workflow {0} is locked by another runner")]
    LockContention(Uuid),

    /// Structural problem: unroutable step type, corrupt context.
    #[error("validation error: {0}")]
    Validation(String),

    /// Context restore/growth failure.
    #[error("context error: {0}")]
    Context(#[from] ContextError),

    /// Storage failure.
    #[error("repository error: {0}")]
    Repository(#[from] flowline_types::error::RepositoryError),
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Executes workflows one step per `run` call.
///
/// Generic over `R: WorkflowRepository` for storage flexibility. The handler
/// registry is constructor-injected and owned by the wiring layer.
pub struct WorkflowEngine<R: WorkflowRepository> {
    repo: Arc<R>,
    registry: Arc<StepHandlerRegistry>,
    events: EventBus,
    stale_lock_after: chrono::Duration,
}

impl<R: WorkflowRepository> WorkflowEngine<R> {
    pub fn new(
        repo: Arc<R>,
        registry: Arc<StepHandlerRegistry>,
        events: EventBus,
        config: &EngineConfig,
    ) -> Self {
        Self {
            repo,
            registry,
            events,
            stale_lock_after: chrono::Duration::seconds(config.stale_lock_secs as i64),
        }
    }

    /// The staleness threshold after which a held lock may be overridden.
    pub fn stale_lock_after(&self) -> chrono::Duration {
        self.stale_lock_after
    }

    /// Execute exactly one step of the workflow.
    ///
    /// Terminal workflows are returned unchanged (idempotent no-op). A held,
    /// non-stale lock yields [`EngineError::LockContention`]. Step failures
    /// are recorded on the workflow (`last_error`, retry bookkeeping) and
    /// returned as `Ok`; only structural and storage problems are `Err`.
    /// Every error path after lock acquisition force-releases the lock.
    pub async fn run(&self, id: Uuid) -> Result<Workflow, EngineError> {
        let workflow = self
            .repo
            .get(&id)
            .await?
            .ok_or(EngineError::NotFound(id))?;

        if workflow.status.is_terminal() {
            tracing::debug!(workflow_id = %id, status = workflow.status.as_str(), "terminal workflow, run is a no-op");
            return Ok(workflow);
        }

        let now = Utc::now();
        let stale_cutoff = now - self.stale_lock_after;
        if !self.repo.try_lock(&id, now, stale_cutoff).await? {
            tracing::debug!(workflow_id = %id, "lock contention");
            return Err(EngineError::LockContention(id));
        }

        let mut workflow = workflow;
        workflow.locked = true;
        workflow.locked_at = Some(now);
        workflow.status = WorkflowStatus::Running;

        // The lock is held from here; never leave without releasing it.
        match self.execute_current_step(workflow).await {
            Ok(updated) => Ok(updated),
            Err(err) => {
                if let Err(unlock_err) = self.repo.unlock(&id).await {
                    tracing::error!(
                        workflow_id = %id,
                        error = %unlock_err,
                        "failed to force-release workflow lock"
                    );
                }
                Err(err)
            }
        }
    }

    /// Run the step at `current_step` and persist the outcome.
    async fn execute_current_step(&self, mut wf: Workflow) -> Result<Workflow, EngineError> {
        if wf.is_exhausted() {
            wf.status = WorkflowStatus::Completed;
            self.release_and_persist(&mut wf).await?;
            self.events.publish(OrchestratorEvent::WorkflowCompleted {
                workflow_id: wf.id,
            });
            return Ok(wf);
        }

        let step_index = wf.current_step as usize;
        let step = wf.steps[step_index].clone();

        let Some(handler) = self.registry.get(&step.step_type) else {
            // Unroutable steps are fatal: fail the workflow so it cannot be
            // re-dispatched forever, then surface the validation error.
            let reason = format!("no handler registered for step type '{}'", step.step_type);
            tracing::error!(
                workflow_id = %wf.id,
                step_id = step.id.as_str(),
                reason = reason.as_str(),
                "step is not routable"
            );
            wf.status = WorkflowStatus::Failed;
            wf.last_error = Some(reason.clone());
            self.release_and_persist(&mut wf).await?;
            self.events.publish(OrchestratorEvent::WorkflowFailed {
                workflow_id: wf.id,
                error: reason.clone(),
            });
            return Err(EngineError::Validation(reason));
        };

        let mut ctx = WorkflowContext::from_json(wf.context.clone())?;
        let resolved_config = ctx.resolve_config(&step.config);

        self.events.publish(OrchestratorEvent::WorkflowStepStarted {
            workflow_id: wf.id,
            step_id: step.id.clone(),
            step_type: step.step_type.clone(),
        });
        tracing::info!(
            workflow_id = %wf.id,
            step_id = step.id.as_str(),
            step_type = step.step_type.as_str(),
            attempt = step.retries + 1,
            "executing step"
        );

        let started = std::time::Instant::now();
        match handler.execute(&resolved_config, &ctx).await {
            Ok(result) => {
                ctx.merge_step_result(&step.id, result)?;
                wf.context = ctx.to_json();
                wf.current_step += 1;
                wf.last_error = None;
                wf.status = if wf.is_exhausted() {
                    WorkflowStatus::Completed
                } else {
                    WorkflowStatus::Paused
                };
                self.release_and_persist(&mut wf).await?;

                self.events.publish(OrchestratorEvent::WorkflowStepCompleted {
                    workflow_id: wf.id,
                    step_id: step.id.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                if wf.status == WorkflowStatus::Completed {
                    self.events.publish(OrchestratorEvent::WorkflowCompleted {
                        workflow_id: wf.id,
                    });
                }
                Ok(wf)
            }
            Err(step_err) => {
                let error = step_err.to_string();
                let retryable =
                    step_err.is_transient() && step.retries < step.max_retries;
                tracing::warn!(
                    workflow_id = %wf.id,
                    step_id = step.id.as_str(),
                    error = error.as_str(),
                    will_retry = retryable,
                    "step failed"
                );

                if retryable {
                    let step_mut = &mut wf.steps[step_index];
                    step_mut.retries += 1;
                    let backoff = step_mut
                        .backoff_factor
                        .map(|factor| backoff_delay(factor, step_mut.retries));
                    wf.status = WorkflowStatus::Paused;
                    wf.last_error = Some(error.clone());

                    match backoff {
                        Some(delay) => {
                            // Keep the lock; date it so the stale-override
                            // reclaim lands at now + delay.
                            let release_at =
                                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                            wf.locked = true;
                            wf.locked_at = Some(release_at - self.stale_lock_after);
                            wf.updated_at = Utc::now();
                            self.repo.update(&wf).await?;
                        }
                        None => {
                            self.release_and_persist(&mut wf).await?;
                        }
                    }

                    self.events.publish(OrchestratorEvent::WorkflowStepFailed {
                        workflow_id: wf.id,
                        step_id: step.id.clone(),
                        error,
                        will_retry: true,
                    });
                } else {
                    wf.status = WorkflowStatus::Failed;
                    wf.last_error = Some(error.clone());
                    self.release_and_persist(&mut wf).await?;

                    self.events.publish(OrchestratorEvent::WorkflowStepFailed {
                        workflow_id: wf.id,
                        step_id: step.id.clone(),
                        error: error.clone(),
                        will_retry: false,
                    });
                    self.events.publish(OrchestratorEvent::WorkflowFailed {
                        workflow_id: wf.id,
                        error,
                    });
                }
                Ok(wf)
            }
        }
    }

    /// Clear the lock fields and persist the record.
    async fn release_and_persist(&self, wf: &mut Workflow) -> Result<(), EngineError> {
        wf.locked = false;
        wf.locked_at = None;
        wf.updated_at = Utc::now();
        self.repo.update(wf).await?;
        Ok(())
    }
}

/// Exponential step retry delay: `backoff_factor^retries * 1000ms`.
fn backoff_delay(factor: f64, retries: u32) -> Duration {
    Duration::from_millis((factor.powi(retries as i32) * 1000.0) as u64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FlakyHandler, MemoryWorkflowRepository, RecordingHandler};
    use crate::workflow::handler::{StepError, StepHandler};
    use flowline_types::workflow::{Step, empty_context};
    use futures_util::future::BoxFuture;
    use serde_json::{Value, json};

    struct Fixture {
        repo: Arc<MemoryWorkflowRepository>,
        engine: WorkflowEngine<MemoryWorkflowRepository>,
    }

    fn fixture(registry: StepHandlerRegistry) -> Fixture {
        let repo = Arc::new(MemoryWorkflowRepository::new());
        let engine = WorkflowEngine::new(
            Arc::clone(&repo),
            Arc::new(registry),
            EventBus::new(64),
            &EngineConfig::default(),
        );
        Fixture { repo, engine }
    }

    async fn seed(repo: &MemoryWorkflowRepository, steps: Vec<Step>) -> Workflow {
        let wf = Workflow::new(steps, empty_context());
        repo.create(&wf).await.unwrap();
        wf
    }

    // -----------------------------------------------------------------------
    // Scenario A: two-step happy path
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn two_step_workflow_pauses_then_completes() {
        let handler_a = RecordingHandler::returning(json!({ "rows": 3 }));
        let handler_b = RecordingHandler::returning(json!("sent"));
        let mut registry = StepHandlerRegistry::new();
        registry.register("fetch", handler_a.clone()).unwrap();
        registry.register("notify", handler_b.clone()).unwrap();
        let fx = fixture(registry);

        let wf = seed(
            &fx.repo,
            vec![
                Step::new("a", "fetch", json!({})),
                Step::new("b", "notify", json!({})),
            ],
        )
        .await;

        let after_first = fx.engine.run(wf.id).await.unwrap();
        assert_eq!(after_first.status, WorkflowStatus::Paused);
        assert_eq!(after_first.current_step, 1);
        assert!(!after_first.locked);
        let ctx = WorkflowContext::from_json(after_first.context.clone()).unwrap();
        assert_eq!(ctx.step_result("a"), Some(&json!({ "rows": 3 })));
        assert_eq!(ctx.last_result, Some(json!({ "rows": 3 })));

        let after_second = fx.engine.run(wf.id).await.unwrap();
        assert_eq!(after_second.status, WorkflowStatus::Completed);
        assert_eq!(after_second.current_step, 2);
        assert_eq!(handler_a.call_count(), 1);
        assert_eq!(handler_b.call_count(), 1);
    }

    // -----------------------------------------------------------------------
    // Sequential invariant
    // -----------------------------------------------------------------------

    /// Handler that asserts the previous step's result is already in the
    /// context it receives.
    struct DependsOnPrevious;

    impl StepHandler for DependsOnPrevious {
        fn execute<'a>(
            &'a self,
            _config: &'a Value,
            context: &'a WorkflowContext,
        ) -> BoxFuture<'a, Result<Value, StepError>> {
            Box::pin(async move {
                match context.step_result("a") {
                    Some(prev) => Ok(json!({ "saw": prev })),
                    None => Err(StepError::Permanent(
                        "step 'a' result missing from context".to_string(),
                    )),
                }
            })
        }
    }

    #[tokio::test]
    async fn second_step_sees_persisted_first_result() {
        let mut registry = StepHandlerRegistry::new();
        registry
            .register("fetch", RecordingHandler::returning(json!("payload")))
            .unwrap();
        registry
            .register("consume", Arc::new(DependsOnPrevious))
            .unwrap();
        let fx = fixture(registry);

        let wf = seed(
            &fx.repo,
            vec![
                Step::new("a", "fetch", json!({})),
                Step::new("b", "consume", json!({})),
            ],
        )
        .await;

        fx.engine.run(wf.id).await.unwrap();
        let done = fx.engine.run(wf.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        let ctx = WorkflowContext::from_json(done.context).unwrap();
        assert_eq!(ctx.step_result("b"), Some(&json!({ "saw": "payload" })));
    }

    // -----------------------------------------------------------------------
    // Idempotence on terminal workflows
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn run_on_terminal_workflow_is_noop() {
        let handler = RecordingHandler::returning(json!("x"));
        let mut registry = StepHandlerRegistry::new();
        registry.register("fetch", handler.clone()).unwrap();
        let fx = fixture(registry);

        let wf = seed(&fx.repo, vec![Step::new("a", "fetch", json!({}))]).await;
        let done = fx.engine.run(wf.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);

        let again = fx.engine.run(wf.id).await.unwrap();
        assert_eq!(again.status, WorkflowStatus::Completed);
        assert_eq!(again.current_step, done.current_step);
        assert_eq!(handler.call_count(), 1, "terminal run must not re-execute");
    }

    // -----------------------------------------------------------------------
    // Lock exclusivity and staleness
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn locked_workflow_yields_contention() {
        let mut registry = StepHandlerRegistry::new();
        registry
            .register("fetch", RecordingHandler::returning(json!(1)))
            .unwrap();
        let fx = fixture(registry);

        let wf = seed(&fx.repo, vec![Step::new("a", "fetch", json!({}))]).await;
        fx.repo.set_lock(&wf.id, true, Some(Utc::now()));

        let err = fx.engine.run(wf.id).await.unwrap_err();
        assert!(matches!(err, EngineError::LockContention(id) if id == wf.id));
    }

    #[tokio::test]
    async fn stale_lock_is_overridden() {
        let handler = RecordingHandler::returning(json!(1));
        let mut registry = StepHandlerRegistry::new();
        registry.register("fetch", handler.clone()).unwrap();
        let fx = fixture(registry);

        let wf = seed(&fx.repo, vec![Step::new("a", "fetch", json!({}))]).await;
        // Lock held for longer than the 5-minute staleness threshold.
        fx.repo
            .set_lock(&wf.id, true, Some(Utc::now() - chrono::Duration::minutes(6)));

        let done = fx.engine.run(wf.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(handler.call_count(), 1);
    }

    struct SlowHandler;

    impl StepHandler for SlowHandler {
        fn execute<'a>(
            &'a self,
            _config: &'a Value,
            _context: &'a WorkflowContext,
        ) -> BoxFuture<'a, Result<Value, StepError>> {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Ok(json!("done"))
            })
        }
    }

    #[tokio::test]
    async fn concurrent_runs_admit_exactly_one() {
        let mut registry = StepHandlerRegistry::new();
        registry.register("slow", Arc::new(SlowHandler)).unwrap();
        let fx = fixture(registry);
        let engine = Arc::new(fx.engine);

        let wf = seed(&fx.repo, vec![Step::new("a", "slow", json!({}))]).await;

        let first = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run(wf.id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let second = engine.run(wf.id).await;

        assert!(matches!(
            second.unwrap_err(),
            EngineError::LockContention(_)
        ));
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status, WorkflowStatus::Completed);
    }

    // -----------------------------------------------------------------------
    // Retries and backoff
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn transient_failure_consumes_retry_budget_then_fails() {
        let handler = FlakyHandler::transient(u32::MAX);
        let mut registry = StepHandlerRegistry::new();
        registry.register("flaky", handler.clone()).unwrap();
        let fx = fixture(registry);

        let mut step = Step::new("a", "flaky", json!({}));
        step.max_retries = 2;
        let wf = seed(&fx.repo, vec![step]).await;

        let first = fx.engine.run(wf.id).await.unwrap();
        assert_eq!(first.status, WorkflowStatus::Paused);
        assert_eq!(first.steps[0].retries, 1);
        assert!(first.last_error.is_some());

        let second = fx.engine.run(wf.id).await.unwrap();
        assert_eq!(second.status, WorkflowStatus::Paused);
        assert_eq!(second.steps[0].retries, 2);

        // Budget exhausted: third failure is terminal.
        let third = fx.engine.run(wf.id).await.unwrap();
        assert_eq!(third.status, WorkflowStatus::Failed);
        assert_eq!(third.steps[0].retries, 2);
        assert!(third.last_error.unwrap().contains("connection reset"));
        assert_eq!(handler.call_count(), 3);
    }

    #[tokio::test]
    async fn flaky_step_recovers_within_budget() {
        let handler = FlakyHandler::transient(1);
        let mut registry = StepHandlerRegistry::new();
        registry.register("flaky", handler.clone()).unwrap();
        let fx = fixture(registry);

        let wf = seed(&fx.repo, vec![Step::new("a", "flaky", json!({}))]).await;

        let first = fx.engine.run(wf.id).await.unwrap();
        assert_eq!(first.status, WorkflowStatus::Paused);

        let second = fx.engine.run(wf.id).await.unwrap();
        assert_eq!(second.status, WorkflowStatus::Completed);
        let ctx = WorkflowContext::from_json(second.context).unwrap();
        assert_eq!(ctx.step_result("a"), Some(&json!("recovered")));
    }

    #[tokio::test]
    async fn permanent_failure_skips_retry_budget() {
        let handler = FlakyHandler::always_permanent();
        let mut registry = StepHandlerRegistry::new();
        registry.register("broken", handler.clone()).unwrap();
        let fx = fixture(registry);

        let wf = seed(&fx.repo, vec![Step::new("a", "broken", json!({}))]).await;

        let result = fx.engine.run(wf.id).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.steps[0].retries, 0);
        assert!(!result.locked);
        assert_eq!(handler.call_count(), 1);
    }

    #[tokio::test]
    async fn backoff_holds_lock_until_delay_elapses() {
        let handler = FlakyHandler::transient(1);
        let mut registry = StepHandlerRegistry::new();
        registry.register("flaky", handler.clone()).unwrap();

        let repo = Arc::new(MemoryWorkflowRepository::new());
        // 0-second staleness makes the hold expire exactly at the backoff
        // release time, which keeps this test fast.
        let engine = WorkflowEngine::new(
            Arc::clone(&repo),
            Arc::new(registry),
            EventBus::new(64),
            &EngineConfig { stale_lock_secs: 0 },
        );

        let mut step = Step::new("a", "flaky", json!({}));
        // 0.2^1 * 1000ms = 200ms hold
        step.backoff_factor = Some(0.2);
        let wf = Workflow::new(vec![step], empty_context());
        repo.create(&wf).await.unwrap();

        let first = engine.run(wf.id).await.unwrap();
        assert_eq!(first.status, WorkflowStatus::Paused);
        assert!(first.locked, "backoff must hold the lock");

        // Inside the backoff window: contention.
        let err = engine.run(wf.id).await.unwrap_err();
        assert!(matches!(err, EngineError::LockContention(_)));

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        let second = engine.run(wf.id).await.unwrap();
        assert_eq!(second.status, WorkflowStatus::Completed);
    }

    // -----------------------------------------------------------------------
    // Validation and notification
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn missing_handler_is_fatal_and_unlocks() {
        let fx = fixture(StepHandlerRegistry::new());
        let wf = seed(&fx.repo, vec![Step::new("a", "unrouted", json!({}))]).await;

        let err = fx.engine.run(wf.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let stored = fx.repo.get(&wf.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Failed);
        assert!(!stored.locked, "fatal path must release the lock");
        assert!(stored.last_error.unwrap().contains("unrouted"));
    }

    #[tokio::test]
    async fn empty_workflow_completes_immediately() {
        let fx = fixture(StepHandlerRegistry::new());
        let wf = seed(&fx.repo, vec![]).await;

        let done = fx.engine.run(wf.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert!(!done.locked);
    }

    #[tokio::test]
    async fn terminal_transitions_publish_notification_events() {
        let mut registry = StepHandlerRegistry::new();
        registry
            .register("fetch", RecordingHandler::returning(json!(1)))
            .unwrap();

        let repo = Arc::new(MemoryWorkflowRepository::new());
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let engine = WorkflowEngine::new(
            Arc::clone(&repo),
            Arc::new(registry),
            bus,
            &EngineConfig::default(),
        );

        let wf = Workflow::new(vec![Step::new("a", "fetch", json!({}))], empty_context());
        repo.create(&wf).await.unwrap();
        engine.run(wf.id).await.unwrap();

        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, OrchestratorEvent::WorkflowCompleted { workflow_id } if workflow_id == wf.id)
            {
                saw_completed = true;
            }
        }
        assert!(saw_completed, "completion must fire the notification hook");
    }

    #[tokio::test]
    async fn unknown_workflow_is_not_found() {
        let fx = fixture(StepHandlerRegistry::new());
        let err = fx.engine.run(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    // -----------------------------------------------------------------------
    // Backoff arithmetic
    // -----------------------------------------------------------------------

    #[test]
    fn backoff_delay_is_exponential_in_retries() {
        assert_eq!(backoff_delay(2.0, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2.0, 3), Duration::from_millis(8000));
        assert_eq!(backoff_delay(1.5, 2), Duration::from_millis(2250));
    }
}
