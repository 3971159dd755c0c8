//! Workflow domain types.
//!
//! A `Workflow` is a persisted, resumable sequence of `Step`s with a shared
//! JSON context. Insertion order is execution order; the engine advances
//! `current_step` one step per run and persists progress before moving on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow.
///
/// `pending -> running -> {paused -> running (loop) | completed | failed}`.
/// `Completed` and `Failed` are terminal: further run calls are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }

    /// Stable snake_case string used in the database and in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "paused" => Ok(WorkflowStatus::Paused),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            other => Err(format!("unknown workflow status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One unit of work within a workflow.
///
/// `step_type` selects the handler; `config` is an opaque payload passed to
/// it verbatim (after template resolution). Retry bookkeeping lives on the
/// step itself so it survives process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// User-defined step ID, unique within a workflow.
    pub id: String,
    /// Handler discriminator.
    #[serde(rename = "type")]
    pub step_type: String,
    /// Opaque configuration passed to the handler.
    #[serde(default)]
    pub config: Value,
    /// Failed attempts so far for this step.
    #[serde(default)]
    pub retries: u32,
    /// Retry budget for this step.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Exponential backoff base between retries; `None` means retry
    /// immediately on the next run call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_factor: Option<f64>,
}

fn default_max_retries() -> u32 {
    3
}

impl Step {
    /// Convenience constructor for a step with default retry settings.
    pub fn new(id: impl Into<String>, step_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            config,
            retries: 0,
            max_retries: default_max_retries(),
            backoff_factor: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A persisted, resumable sequence of steps with shared context.
///
/// Owned exclusively by the engine while `locked`; otherwise owned by
/// whichever component last wrote it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// UUIDv7 assigned at creation.
    pub id: Uuid,
    /// Ordered steps; insertion order is execution order.
    pub steps: Vec<Step>,
    /// Index of the next step to execute. Monotonically non-decreasing.
    pub current_step: u32,
    /// Serialized execution context: step-id -> result map plus the reserved
    /// last-result slot and seed variables.
    pub context: Value,
    /// Current lifecycle status.
    pub status: WorkflowStatus,
    /// Set while a runner owns this workflow.
    pub locked: bool,
    /// When the lock was taken (or forward-dated to schedule a retry hold).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    /// Most recent step or engine error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Create a new pending workflow with the given steps and context blob.
    pub fn new(steps: Vec<Step>, context: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            steps,
            current_step: 0,
            context,
            status: WorkflowStatus::Pending,
            locked: false,
            locked_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether all steps have been executed.
    pub fn is_exhausted(&self) -> bool {
        self.current_step as usize >= self.steps.len()
    }

    /// The step the engine would execute next, if any.
    pub fn next_step(&self) -> Option<&Step> {
        self.steps.get(self.current_step as usize)
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Listing filter for workflows.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    /// Restrict to a single status.
    pub status: Option<WorkflowStatus>,
    /// Cap the number of returned rows (newest first). `None` = no cap.
    pub limit: Option<u32>,
}

impl WorkflowFilter {
    /// Filter matching workflows in the given status.
    pub fn by_status(status: WorkflowStatus) -> Self {
        Self {
            status: Some(status),
            limit: None,
        }
    }
}

/// An empty context blob, the shape the engine expects on a fresh workflow.
pub fn empty_context() -> Value {
    json!({ "step_results": {}, "variables": {}, "last_result": null })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_workflow() -> Workflow {
        Workflow::new(
            vec![
                Step::new("fetch", "http", json!({ "url": "https://example.com" })),
                Step::new("notify", "email", json!({ "to": "ops@example.com" })),
            ],
            empty_context(),
        )
    }

    #[test]
    fn status_terminality() {
        assert!(!WorkflowStatus::Pending.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Paused,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
        ] {
            let parsed: WorkflowStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("cancelled".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn new_workflow_is_pending_and_unlocked() {
        let wf = two_step_workflow();
        assert_eq!(wf.status, WorkflowStatus::Pending);
        assert_eq!(wf.current_step, 0);
        assert!(!wf.locked);
        assert!(wf.locked_at.is_none());
        assert!(wf.last_error.is_none());
    }

    #[test]
    fn next_step_follows_current_index() {
        let mut wf = two_step_workflow();
        assert_eq!(wf.next_step().unwrap().id, "fetch");
        wf.current_step = 1;
        assert_eq!(wf.next_step().unwrap().id, "notify");
        wf.current_step = 2;
        assert!(wf.next_step().is_none());
        assert!(wf.is_exhausted());
    }

    #[test]
    fn step_serde_uses_type_tag_and_defaults() {
        let json_str = r#"{ "id": "fetch", "type": "http", "config": { "url": "x" } }"#;
        let step: Step = serde_json::from_str(json_str).unwrap();
        assert_eq!(step.step_type, "http");
        assert_eq!(step.retries, 0);
        assert_eq!(step.max_retries, 3);
        assert!(step.backoff_factor.is_none());

        let out = serde_json::to_value(&step).unwrap();
        assert_eq!(out["type"], json!("http"));
        assert!(out.get("backoff_factor").is_none());
    }

    #[test]
    fn workflow_json_roundtrip() {
        let wf = two_step_workflow();
        let encoded = serde_json::to_string(&wf).unwrap();
        let decoded: Workflow = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, wf.id);
        assert_eq!(decoded.steps.len(), 2);
        assert_eq!(decoded.status, WorkflowStatus::Pending);
    }
}
