//! Orchestrator lifecycle events.
//!
//! Published on the core event bus. Terminal workflow events
//! (`WorkflowCompleted` / `WorkflowFailed`) are the status-change
//! notification hook: external collaborators (email delivery, dashboards)
//! subscribe to the bus instead of being called into from the engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted by the engine, queue, and scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// A workflow run acquired the lock and began a step.
    WorkflowStepStarted {
        workflow_id: Uuid,
        step_id: String,
        step_type: String,
    },
    /// A step finished and its result was merged into the context.
    WorkflowStepCompleted {
        workflow_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },
    /// A step failed; `will_retry` reflects the remaining retry budget.
    WorkflowStepFailed {
        workflow_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },
    /// Terminal success.
    WorkflowCompleted { workflow_id: Uuid },
    /// Terminal failure.
    WorkflowFailed { workflow_id: Uuid, error: String },

    /// A job entered the queue.
    JobEnqueued {
        job_id: Uuid,
        task_id: Uuid,
        priority: u8,
    },
    /// A job's handler returned success.
    JobCompleted { job_id: Uuid },
    /// A job's handler failed; the job may still be retried by its backend.
    JobFailed {
        job_id: Uuid,
        error: String,
        attempts: u32,
    },
    /// Which queue backend was selected at startup.
    QueueBackendSelected { backend: String },

    /// A cron trigger fired and enqueued its workflow.
    ScheduleFired {
        schedule_id: Uuid,
        workflow_id: Uuid,
    },
    /// A schedule was disabled because its trigger expression is invalid.
    ScheduleDisabled { schedule_id: Uuid, reason: String },
}
