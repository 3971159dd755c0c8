//! In-process job execution backend.
//!
//! A fixed-interval poller that scans the `jobs` table for due pending work
//! and executes it serially. This is the fallback when no broker is
//! reachable (or when forced by configuration). It is strictly
//! single-process: it provides durability through the jobs table but no
//! horizontal scaling, and operators are told so at selection time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowline_types::error::RepositoryError;
use flowline_types::event::OrchestratorEvent;
use flowline_types::job::{Job, JobStatus};
use tokio_util::sync::CancellationToken;

use crate::event::EventBus;
use crate::repository::JobRepository;

use super::JobHandler;

/// Jobs picked up per poll.
const POLL_BATCH: u32 = 32;

/// Job retry backoff: `2^attempts * 5000ms`.
fn retry_backoff(attempts: u32) -> Duration {
    Duration::from_millis(2u64.saturating_pow(attempts).saturating_mul(5000))
}

/// Serial poller executing due jobs.
pub struct InProcessPoller<R: JobRepository> {
    repo: Arc<R>,
    handler: Arc<dyn JobHandler>,
    events: EventBus,
    interval: Duration,
}

impl<R: JobRepository> InProcessPoller<R> {
    pub fn new(
        repo: Arc<R>,
        handler: Arc<dyn JobHandler>,
        events: EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            repo,
            handler,
            events,
            interval,
        }
    }

    /// Poll until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "in-process poller started");
        // First poll one interval from now, then on a fixed cadence.
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_due_jobs().await {
                        tracing::warn!(error = %err, "job poll failed");
                    }
                }
            }
        }
        tracing::info!("in-process poller stopped");
    }

    /// One poll pass: execute every due pending job, serially.
    pub async fn run_due_jobs(&self) -> Result<usize, RepositoryError> {
        let due = self.repo.due_jobs(Utc::now(), POLL_BATCH).await?;
        let count = due.len();
        for job in due {
            self.execute(job).await?;
        }
        Ok(count)
    }

    async fn execute(&self, mut job: Job) -> Result<(), RepositoryError> {
        tracing::debug!(job_id = %job.id, attempt = job.attempts + 1, "executing job");
        job.status = JobStatus::Running;
        job.last_run_at = Some(Utc::now());
        job.updated_at = Utc::now();
        self.repo.update(&job).await?;

        match self.handler.run_task(job.task_id).await {
            Ok(()) => {
                job.status = JobStatus::Completed;
                job.last_error = None;
                job.updated_at = Utc::now();
                self.repo.update(&job).await?;
                self.events
                    .publish(OrchestratorEvent::JobCompleted { job_id: job.id });
            }
            Err(failure) => {
                job.attempts += 1;
                job.last_error = Some(failure.0.clone());
                if job.budget_exhausted() {
                    job.status = JobStatus::Failed;
                    tracing::warn!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = failure.0.as_str(),
                        "job exhausted attempt budget"
                    );
                } else {
                    let delay = retry_backoff(job.attempts);
                    job.status = JobStatus::Pending;
                    job.next_run_at =
                        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                    tracing::debug!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        "job failed, scheduling retry"
                    );
                }
                job.updated_at = Utc::now();
                self.repo.update(&job).await?;
                self.events.publish(OrchestratorEvent::JobFailed {
                    job_id: job.id,
                    error: failure.0,
                    attempts: job.attempts,
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryJobRepository, ScriptedJobHandler};
    use uuid::Uuid;

    fn poller(
        repo: &Arc<MemoryJobRepository>,
        handler: Arc<ScriptedJobHandler>,
    ) -> InProcessPoller<MemoryJobRepository> {
        InProcessPoller::new(
            Arc::clone(repo),
            handler as Arc<dyn JobHandler>,
            EventBus::new(16),
            Duration::from_secs(5),
        )
    }

    /// Make a job due again immediately, bypassing its backoff.
    async fn force_due(repo: &MemoryJobRepository, id: &Uuid) {
        let mut job = repo.get(id).await.unwrap().unwrap();
        job.next_run_at = Utc::now();
        repo.update(&job).await.unwrap();
    }

    #[tokio::test]
    async fn executes_due_job_to_completion() {
        let repo = Arc::new(MemoryJobRepository::new());
        let handler = ScriptedJobHandler::failing(0);
        let poller = poller(&repo, handler.clone());

        let job = Job::new(Uuid::now_v7(), 3);
        repo.create(&job).await.unwrap();

        let ran = poller.run_due_jobs().await.unwrap();
        assert_eq!(ran, 1);
        assert_eq!(handler.call_count(), 1);

        let stored = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 0);
        assert!(stored.last_run_at.is_some());
    }

    #[tokio::test]
    async fn failure_applies_exponential_backoff() {
        let repo = Arc::new(MemoryJobRepository::new());
        let handler = ScriptedJobHandler::failing(u32::MAX);
        let poller = poller(&repo, handler);

        let job = Job::new(Uuid::now_v7(), 3);
        repo.create(&job).await.unwrap();

        let before = Utc::now();
        poller.run_due_jobs().await.unwrap();

        let stored = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 1);
        // 2^1 * 5000ms = 10s
        assert!(stored.next_run_at >= before + chrono::Duration::seconds(9));
        assert!(stored.last_error.is_some());
    }

    #[tokio::test]
    async fn backed_off_job_is_not_due() {
        let repo = Arc::new(MemoryJobRepository::new());
        let handler = ScriptedJobHandler::failing(u32::MAX);
        let poller = poller(&repo, handler.clone());

        let job = Job::new(Uuid::now_v7(), 3);
        repo.create(&job).await.unwrap();

        poller.run_due_jobs().await.unwrap();
        // Second pass: the job sits in its backoff window.
        let ran = poller.run_due_jobs().await.unwrap();
        assert_eq!(ran, 0);
        assert_eq!(handler.call_count(), 1);
    }

    // Scenario: max_attempts = 3, handler always fails.
    #[tokio::test]
    async fn three_failures_exhaust_budget_and_mark_failed() {
        let repo = Arc::new(MemoryJobRepository::new());
        let handler = ScriptedJobHandler::failing(u32::MAX);
        let poller = poller(&repo, handler.clone());

        let job = Job::new(Uuid::now_v7(), 3);
        repo.create(&job).await.unwrap();

        for _ in 0..3 {
            force_due(&repo, &job.id).await;
            poller.run_due_jobs().await.unwrap();
        }

        let stored = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 3);
        assert_eq!(handler.call_count(), 3);

        // Terminal: further polls never pick it up again.
        force_due(&repo, &job.id).await;
        let ran = poller.run_due_jobs().await.unwrap();
        assert_eq!(ran, 0);
        assert_eq!(handler.call_count(), 3);
    }

    #[tokio::test]
    async fn attempts_never_exceed_max_attempts() {
        let repo = Arc::new(MemoryJobRepository::new());
        let handler = ScriptedJobHandler::failing(u32::MAX);
        let poller = poller(&repo, handler);

        let job = Job::new(Uuid::now_v7(), 2);
        repo.create(&job).await.unwrap();

        for _ in 0..5 {
            force_due(&repo, &job.id).await;
            poller.run_due_jobs().await.unwrap();
        }

        let stored = repo.get(&job.id).await.unwrap().unwrap();
        assert!(stored.attempts <= stored.max_attempts);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn recovers_when_handler_starts_succeeding() {
        let repo = Arc::new(MemoryJobRepository::new());
        let handler = ScriptedJobHandler::failing(1);
        let poller = poller(&repo, handler);

        let job = Job::new(Uuid::now_v7(), 3);
        repo.create(&job).await.unwrap();

        poller.run_due_jobs().await.unwrap();
        force_due(&repo, &job.id).await;
        poller.run_due_jobs().await.unwrap();

        let stored = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 1);
    }

    #[test]
    fn backoff_formula_matches_spec() {
        assert_eq!(retry_backoff(1), Duration::from_millis(10_000));
        assert_eq!(retry_backoff(2), Duration::from_millis(20_000));
        assert_eq!(retry_backoff(3), Duration::from_millis(40_000));
    }
}
