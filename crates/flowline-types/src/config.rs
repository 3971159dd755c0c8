//! Orchestrator configuration types.
//!
//! `OrchestratorConfig` represents the top-level `config.toml`. All fields
//! have defaults matching the documented behavior: 5-minute stale-lock
//! threshold, 5-second poll interval, 3 job attempts, scheduler enqueue
//! priority 5.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// Top-level configuration for the orchestration core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Workflow engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Locks older than this may be overridden by a new runner. Overriding a
    /// lock whose holder is merely slow risks double execution of a step;
    /// this threshold bounds how long a crashed holder can wedge a workflow.
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,
}

fn default_stale_lock_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_lock_secs: default_stale_lock_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Which job-queue backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackendChoice {
    /// Probe the broker; fall back to in-process with a warning if
    /// unreachable.
    Auto,
    /// Require the broker; startup fails if it cannot be reached.
    Broker,
    /// Single-process poller. Does not scale horizontally.
    InProcess,
}

/// Job queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Backend selection policy.
    #[serde(default = "default_backend")]
    pub backend: QueueBackendChoice,
    /// In-process poller interval.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Attempt budget for new jobs.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    #[serde(default)]
    pub broker: BrokerConfig,
}

fn default_backend() -> QueueBackendChoice {
    QueueBackendChoice::Auto
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            poll_interval_secs: default_poll_interval_secs(),
            default_max_attempts: default_max_attempts(),
            broker: BrokerConfig::default(),
        }
    }
}

/// Distributed broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Base URL of the broker service.
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Queue name this process produces to and consumes from.
    #[serde(default = "default_queue_name")]
    pub queue: String,
    /// Long-poll wait per pull request.
    #[serde(default = "default_pull_wait_secs")]
    pub pull_wait_secs: u64,
    /// Base delay of the broker's own exponential retry backoff.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
}

fn default_broker_url() -> String {
    "http://127.0.0.1:8750".to_string()
}

fn default_queue_name() -> String {
    "workflows".to_string()
}

fn default_pull_wait_secs() -> u64 {
    20
}

fn default_backoff_base_secs() -> u64 {
    5
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            queue: default_queue_name(),
            pull_wait_secs: default_pull_wait_secs(),
            backoff_base_secs: default_backoff_base_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Priority attached to jobs enqueued by cron ticks.
    #[serde(default = "default_enqueue_priority")]
    pub enqueue_priority: u8,
}

fn default_enqueue_priority() -> u8 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enqueue_priority: default_enqueue_priority(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
