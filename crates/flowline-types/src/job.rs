//! Job domain types.
//!
//! A `Job` is a queued unit of execution backing a scheduled or ad-hoc
//! workflow run. Its attempt/backoff bookkeeping is independent of the
//! step-level retries inside the workflow it points at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: '{other}'")),
        }
    }
}

/// A queued unit of execution with its own attempt budget.
///
/// Invariant: `attempts <= max_attempts`; crossing the budget forces
/// `status = failed` and only an explicit retry resets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// UUIDv7 assigned at enqueue time.
    pub id: Uuid,
    /// The workflow this job executes.
    pub task_id: Uuid,
    pub status: JobStatus,
    /// Execution attempts consumed so far.
    pub attempts: u32,
    /// Attempt budget before the job is marked failed.
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest time the job is eligible to run.
    pub next_run_at: DateTime<Utc>,
    /// When the job last started executing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a pending job for the given workflow, runnable immediately.
    pub fn new(task_id: Uuid, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            task_id,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            next_run_at: now,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the attempt budget is exhausted.
    pub fn budget_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}
