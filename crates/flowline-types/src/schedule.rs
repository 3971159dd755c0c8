//! Schedule domain types.
//!
//! A `Schedule` binds a cron trigger expression to a workflow. The scheduler
//! registers enabled schedules as recurring cron jobs; each tick enqueues a
//! run of the bound workflow rather than executing it inline, decoupling
//! trigger cadence from execution reliability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted trigger-expression-to-workflow binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// UUIDv7 assigned at creation.
    pub id: Uuid,
    /// The workflow enqueued on each tick.
    pub workflow_id: Uuid,
    /// Cron expression (5-field or 6-field with seconds), fixed UTC.
    pub trigger_expr: String,
    /// Disabled schedules are skipped at initialization and never tick.
    pub enabled: bool,
    /// When the trigger last fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Informational only.
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Create an enabled schedule for a workflow.
    pub fn new(workflow_id: Uuid, trigger_expr: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            trigger_expr: trigger_expr.into(),
            enabled: true,
            last_run_at: None,
            description: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Options accepted when creating a schedule.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub enabled: bool,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

impl ScheduleOptions {
    /// Enabled, no description or tags.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }
}
