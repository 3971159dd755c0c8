//! Cron scheduler wrapping `tokio-cron-scheduler` for workflow triggers.
//!
//! Holds `Schedule` records and converts their trigger expressions into
//! recurring ticks. Each tick records `last_run_at` and enqueues a workflow
//! run through the injected enqueue callback -- the tick never executes the
//! workflow inline, so trigger cadence stays decoupled from execution
//! reliability. Timezone is fixed UTC.
//!
//! The active-schedule map is owned by the `Scheduler` instance and dies
//! with it; there is no module-level registry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowline_types::event::OrchestratorEvent;
use flowline_types::schedule::{Schedule, ScheduleOptions};
use futures_util::future::BoxFuture;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::ScheduleRepository;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by scheduling operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Failed to create or manipulate a cron job.
    #[error("scheduler error: {0}")]
    Job(String),

    /// Invalid trigger expression.
    #[error("invalid trigger expression: {0}")]
    InvalidExpression(String),

    /// Schedule not found (in storage or in the active map).
    #[error("schedule not found: {0}")]
    NotFound(Uuid),

    #[error("repository error: {0}")]
    Repository(#[from] flowline_types::error::RepositoryError),
}

// ---------------------------------------------------------------------------
// Trigger expression handling
// ---------------------------------------------------------------------------

/// Normalize a trigger expression to 6-field cron (with seconds), validating
/// it with croner.
///
/// Accepted inputs:
/// - standard 5-field cron (a `0` seconds field is prepended)
/// - 6-field cron with seconds (passed through)
/// - `"every N seconds|minutes|hours"` interval shorthand
pub fn normalize_trigger(input: &str) -> Result<String, SchedulerError> {
    let trimmed = input.trim();

    let candidate = {
        let fields = trimmed.split_whitespace().count();
        match fields {
            5 => Some(format!("0 {trimmed}")),
            6 => Some(trimmed.to_string()),
            _ => interval_shorthand(trimmed),
        }
    };

    let Some(expr) = candidate else {
        return Err(SchedulerError::InvalidExpression(format!(
            "unrecognized trigger format: '{trimmed}'"
        )));
    };

    expr.parse::<croner::Cron>()
        .map_err(|e| SchedulerError::InvalidExpression(e.to_string()))?;
    Ok(expr)
}

/// `"every N <unit>"` shorthand kept from the interval-based trigger format.
fn interval_shorthand(input: &str) -> Option<String> {
    let rest = input.to_lowercase();
    let rest = rest.strip_prefix("every ")?;
    let (count, unit) = rest.split_once(' ')?;
    let n: u32 = count.parse().ok()?;
    if n == 0 {
        return None;
    }
    match unit.trim_end_matches('s') {
        "second" => Some(format!("*/{n} * * * * *")),
        "minute" => Some(format!("0 */{n} * * * *")),
        "hour" => Some(format!("0 0 */{n} * * *")),
        _ => None,
    }
}

/// The next tick strictly after `after`, or `None` for expressions that
/// never fire again.
pub fn next_run_after(
    trigger_expr: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    let expr = normalize_trigger(trigger_expr)?;
    let cron = expr
        .parse::<croner::Cron>()
        .map_err(|e| SchedulerError::InvalidExpression(e.to_string()))?;
    Ok(cron.iter_after(after).next())
}

/// Count ticks `t` with `after < t <= until`.
///
/// Used for missed-run accounting: an N-minute trigger over a T-long window
/// yields `floor(T/N)` ticks.
pub fn occurrences_between(
    trigger_expr: &str,
    after: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
    let expr = normalize_trigger(trigger_expr)?;
    let cron = expr
        .parse::<croner::Cron>()
        .map_err(|e| SchedulerError::InvalidExpression(e.to_string()))?;

    let mut ticks = Vec::new();
    for next in cron.iter_after(after) {
        if next > until {
            break;
        }
        ticks.push(next);
    }
    Ok(ticks)
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Callback invoked on each tick to enqueue a workflow run. Errors are the
/// callback's to log; the tick itself never fails.
pub type EnqueueFn = Arc<dyn Fn(Uuid, u8) -> BoxFuture<'static, ()> + Send + Sync>;

/// A registered cron job for one schedule.
struct ActiveSchedule {
    /// Job UUID assigned by tokio-cron-scheduler.
    job_id: Uuid,
    /// Normalized 6-field expression.
    cron_expr: String,
}

/// Converts persisted schedules into recurring enqueue ticks.
pub struct Scheduler<R: ScheduleRepository> {
    repo: Arc<R>,
    inner: Arc<RwLock<Option<JobScheduler>>>,
    active: Arc<RwLock<HashMap<Uuid, ActiveSchedule>>>,
    enqueue: EnqueueFn,
    events: EventBus,
    enqueue_priority: u8,
}

impl<R: ScheduleRepository + 'static> Scheduler<R> {
    pub fn new(repo: Arc<R>, enqueue: EnqueueFn, events: EventBus, enqueue_priority: u8) -> Self {
        Self {
            repo,
            inner: Arc::new(RwLock::new(None)),
            active: Arc::new(RwLock::new(HashMap::new())),
            enqueue,
            events,
            enqueue_priority,
        }
    }

    /// Start the underlying cron engine. Must be called before schedules can
    /// be registered.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Job(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::Job(e.to_string()))?;

        *self.inner.write().await = Some(scheduler);
        tracing::info!("scheduler started");
        Ok(())
    }

    /// Stop the cron engine and drop all active registrations.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        if let Some(mut scheduler) = self.inner.write().await.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| SchedulerError::Job(e.to_string()))?;
            tracing::info!("scheduler stopped");
        }
        self.active.write().await.clear();
        Ok(())
    }

    /// Load all enabled schedules and start each one.
    ///
    /// A schedule with an invalid trigger expression is persisted as
    /// disabled and skipped -- it will not be retried every startup.
    pub async fn initialize(&self) -> Result<usize, SchedulerError> {
        let schedules = self.repo.list_enabled().await?;
        let total = schedules.len();
        let mut started = 0usize;

        for schedule in &schedules {
            match self.start_schedule(schedule).await {
                Ok(()) => started += 1,
                Err(SchedulerError::InvalidExpression(reason)) => {
                    tracing::warn!(
                        schedule_id = %schedule.id,
                        trigger = schedule.trigger_expr.as_str(),
                        reason = reason.as_str(),
                        "schedule auto-disabled"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        tracing::info!(total, started, "scheduler initialized");
        Ok(started)
    }

    /// Validate, persist, and (when enabled) start a new schedule.
    ///
    /// An invalid expression is rejected before anything is persisted.
    pub async fn create_schedule(
        &self,
        workflow_id: Uuid,
        trigger_expr: &str,
        opts: ScheduleOptions,
    ) -> Result<Schedule, SchedulerError> {
        normalize_trigger(trigger_expr)?;

        let mut schedule = Schedule::new(workflow_id, trigger_expr);
        schedule.enabled = opts.enabled;
        schedule.description = opts.description;
        schedule.tags = opts.tags;
        self.repo.create(&schedule).await?;

        if schedule.enabled {
            self.start_schedule(&schedule).await?;
        }
        tracing::info!(
            schedule_id = %schedule.id,
            workflow_id = %workflow_id,
            trigger = trigger_expr,
            enabled = schedule.enabled,
            "schedule created"
        );
        Ok(schedule)
    }

    /// Register a recurring trigger for a persisted schedule.
    ///
    /// If the trigger expression is invalid, the schedule is persisted as
    /// disabled and `InvalidExpression` is returned.
    pub async fn start_schedule(&self, schedule: &Schedule) -> Result<(), SchedulerError> {
        let cron_expr = match normalize_trigger(&schedule.trigger_expr) {
            Ok(expr) => expr,
            Err(SchedulerError::InvalidExpression(reason)) => {
                self.repo.set_enabled(&schedule.id, false).await?;
                self.events.publish(OrchestratorEvent::ScheduleDisabled {
                    schedule_id: schedule.id,
                    reason: reason.clone(),
                });
                return Err(SchedulerError::InvalidExpression(reason));
            }
            Err(other) => return Err(other),
        };

        let inner = self.inner.read().await;
        let scheduler = inner
            .as_ref()
            .ok_or_else(|| SchedulerError::Job("scheduler not started".to_string()))?;

        let schedule_id = schedule.id;
        let workflow_id = schedule.workflow_id;
        let repo = Arc::clone(&self.repo);
        let enqueue = Arc::clone(&self.enqueue);
        let events = self.events.clone();
        let priority = self.enqueue_priority;

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let repo = Arc::clone(&repo);
            let enqueue = Arc::clone(&enqueue);
            let events = events.clone();
            Box::pin(async move {
                let now = Utc::now();
                tracing::debug!(%schedule_id, %workflow_id, "cron trigger fired");
                if let Err(err) = repo.touch_last_run(&schedule_id, now).await {
                    tracing::warn!(%schedule_id, error = %err, "failed to record trigger fire");
                }
                events.publish(OrchestratorEvent::ScheduleFired {
                    schedule_id,
                    workflow_id,
                });
                enqueue(workflow_id, priority).await;
            })
        })
        .map_err(|e| SchedulerError::InvalidExpression(e.to_string()))?;

        let job_id = job.guid();
        scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::Job(e.to_string()))?;

        self.active
            .write()
            .await
            .insert(schedule_id, ActiveSchedule { job_id, cron_expr });

        tracing::info!(%schedule_id, %job_id, "schedule started");
        Ok(())
    }

    /// Cancel a schedule's recurring trigger and drop its bookkeeping.
    pub async fn stop_schedule(&self, schedule_id: Uuid) -> Result<(), SchedulerError> {
        let entry = self
            .active
            .write()
            .await
            .remove(&schedule_id)
            .ok_or(SchedulerError::NotFound(schedule_id))?;

        if let Some(scheduler) = self.inner.read().await.as_ref() {
            scheduler
                .remove(&entry.job_id)
                .await
                .map_err(|e| SchedulerError::Job(e.to_string()))?;
        }
        tracing::info!(%schedule_id, "schedule stopped");
        Ok(())
    }

    /// Persist changes to a schedule, restarting its trigger as needed.
    pub async fn update_schedule(&self, schedule: &Schedule) -> Result<(), SchedulerError> {
        normalize_trigger(&schedule.trigger_expr)?;

        // Stop the old registration if there is one.
        match self.stop_schedule(schedule.id).await {
            Ok(()) | Err(SchedulerError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        self.repo.update(schedule).await?;
        if schedule.enabled {
            self.start_schedule(schedule).await?;
        }
        tracing::info!(schedule_id = %schedule.id, "schedule updated");
        Ok(())
    }

    /// Stop and delete a schedule. Returns `true` if it existed.
    pub async fn delete_schedule(&self, schedule_id: Uuid) -> Result<bool, SchedulerError> {
        match self.stop_schedule(schedule_id).await {
            Ok(()) | Err(SchedulerError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        let existed = self.repo.delete(&schedule_id).await?;
        tracing::info!(%schedule_id, existed, "schedule deleted");
        Ok(existed)
    }

    /// Derived next fire time of an active or stored schedule.
    pub async fn next_run_at(
        &self,
        schedule_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        if let Some(entry) = self.active.read().await.get(&schedule_id) {
            let cron = entry
                .cron_expr
                .parse::<croner::Cron>()
                .map_err(|e| SchedulerError::InvalidExpression(e.to_string()))?;
            return Ok(cron.iter_after(Utc::now()).next());
        }
        let schedule = self
            .repo
            .get(&schedule_id)
            .await?
            .ok_or(SchedulerError::NotFound(schedule_id))?;
        next_run_after(&schedule.trigger_expr, Utc::now())
    }

    /// Number of schedules with a live trigger registration.
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
