//! Distributed broker contract and the worker that consumes it.
//!
//! The broker owns durability, prioritization, and base retry semantics for
//! jobs pushed to it; this module defines the client trait the queue speaks
//! and the worker loop that pulls deliveries, invokes the job handler, and
//! mirrors outcomes back into the local `jobs` table.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowline_types::event::OrchestratorEvent;
use flowline_types::job::JobStatus;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::JobRepository;

use super::JobHandler;

/// Pause after a failed pull before asking the broker again.
const PULL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A job submission handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerPush {
    pub job_id: Uuid,
    pub task_id: Uuid,
    /// Higher runs earlier.
    pub priority: u8,
    /// Attempt budget the broker enforces on its side.
    pub max_attempts: u32,
    /// Base of the broker's exponential retry backoff.
    pub backoff_base: Duration,
}

/// One delivery pulled from the broker.
#[derive(Debug, Clone)]
pub struct BrokerDelivery {
    /// Opaque receipt used to ack/nack this delivery.
    pub receipt: String,
    pub job_id: Uuid,
    pub task_id: Uuid,
    /// 1-based attempt number as counted by the broker.
    pub attempt: u32,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Broker communication failure.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached at all.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The broker answered with an error status.
    #[error("broker returned status {0}")]
    Status(u16),

    /// The broker answered something the client could not interpret.
    #[error("broker protocol error: {0}")]
    Protocol(String),

    /// The local circuit protecting the broker is open.
    #[error("broker circuit '{0}' is open")]
    CircuitOpen(String),
}

impl BrokerError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Unreachable(_) => true,
            BrokerError::Status(code) => *code == 429 || *code >= 500,
            BrokerError::Protocol(_) | BrokerError::CircuitOpen(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// BrokerClient
// ---------------------------------------------------------------------------

/// Client for a distributed job broker.
///
/// Implemented over HTTP in flowline-infra; tests use a scripted in-memory
/// double.
pub trait BrokerClient: Send + Sync {
    /// Reachability probe used during backend selection.
    fn ping(&self) -> impl std::future::Future<Output = Result<(), BrokerError>> + Send;

    /// Submit a job.
    fn push(
        &self,
        push: &BrokerPush,
    ) -> impl std::future::Future<Output = Result<(), BrokerError>> + Send;

    /// Long-poll for the next delivery; `None` when the wait elapsed empty.
    fn pull(
        &self,
        wait: Duration,
    ) -> impl std::future::Future<Output = Result<Option<BrokerDelivery>, BrokerError>> + Send;

    /// Confirm successful processing of a delivery.
    fn ack(
        &self,
        receipt: &str,
    ) -> impl std::future::Future<Output = Result<(), BrokerError>> + Send;

    /// Report failed processing; the broker applies its retry policy.
    fn nack(
        &self,
        receipt: &str,
        error: &str,
    ) -> impl std::future::Future<Output = Result<(), BrokerError>> + Send;
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// Consume deliveries until cancelled.
///
/// Each delivery runs the job handler; the outcome is acked/nacked to the
/// broker and mirrored into the local job record so operators see one
/// consistent view regardless of backend.
pub(crate) async fn run_worker<C, R>(
    client: Arc<C>,
    repo: Arc<R>,
    handler: Arc<dyn JobHandler>,
    events: EventBus,
    pull_wait: Duration,
    cancel: CancellationToken,
) where
    C: BrokerClient,
    R: JobRepository,
{
    tracing::info!("broker worker started");
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            result = client.pull(pull_wait) => result,
        };

        match delivery {
            Ok(Some(delivery)) => {
                process_delivery(&*client, &*repo, &*handler, &events, delivery).await;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "broker pull failed, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(PULL_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    tracing::info!("broker worker stopped");
}

async fn process_delivery<C, R>(
    client: &C,
    repo: &R,
    handler: &dyn JobHandler,
    events: &EventBus,
    delivery: BrokerDelivery,
) where
    C: BrokerClient,
    R: JobRepository,
{
    tracing::debug!(
        job_id = %delivery.job_id,
        attempt = delivery.attempt,
        "processing broker delivery"
    );

    // Mirror the attempt into the local record before running.
    let mut job = match repo.get(&delivery.job_id).await {
        Ok(job) => job,
        Err(err) => {
            tracing::warn!(job_id = %delivery.job_id, error = %err, "failed to load job record");
            None
        }
    };
    if let Some(job) = job.as_mut() {
        job.status = JobStatus::Running;
        job.attempts = delivery.attempt.max(job.attempts);
        job.last_run_at = Some(Utc::now());
        job.updated_at = Utc::now();
        if let Err(err) = repo.update(job).await {
            tracing::warn!(job_id = %job.id, error = %err, "failed to mirror job start");
        }
    }

    match handler.run_task(delivery.task_id).await {
        Ok(()) => {
            if let Err(err) = client.ack(&delivery.receipt).await {
                tracing::warn!(job_id = %delivery.job_id, error = %err, "ack failed");
            }
            if let Some(job) = job.as_mut() {
                job.status = JobStatus::Completed;
                job.last_error = None;
                job.updated_at = Utc::now();
                if let Err(err) = repo.update(job).await {
                    tracing::warn!(job_id = %job.id, error = %err, "failed to mirror job completion");
                }
            }
            events.publish(OrchestratorEvent::JobCompleted {
                job_id: delivery.job_id,
            });
        }
        Err(failure) => {
            tracing::warn!(
                job_id = %delivery.job_id,
                attempt = delivery.attempt,
                error = failure.0.as_str(),
                "job handler failed"
            );
            if let Err(err) = client.nack(&delivery.receipt, &failure.0).await {
                tracing::warn!(job_id = %delivery.job_id, error = %err, "nack failed");
            }
            if let Some(job) = job.as_mut() {
                job.last_error = Some(failure.0.clone());
                // The broker stops redelivering once its budget is spent.
                job.status = if delivery.attempt >= job.max_attempts {
                    JobStatus::Failed
                } else {
                    JobStatus::Pending
                };
                job.updated_at = Utc::now();
                if let Err(err) = repo.update(job).await {
                    tracing::warn!(job_id = %job.id, error = %err, "failed to mirror job failure");
                }
            }
            events.publish(OrchestratorEvent::JobFailed {
                job_id: delivery.job_id,
                error: failure.0,
                attempts: delivery.attempt,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryJobRepository, MockBroker, ScriptedJobHandler};
    use flowline_types::job::Job;

    #[test]
    fn broker_error_transience() {
        assert!(BrokerError::Unreachable("refused".into()).is_transient());
        assert!(BrokerError::Status(503).is_transient());
        assert!(BrokerError::Status(429).is_transient());
        assert!(!BrokerError::Status(400).is_transient());
        assert!(!BrokerError::Protocol("bad json".into()).is_transient());
        assert!(!BrokerError::CircuitOpen("broker:workflows".into()).is_transient());
    }

    #[tokio::test]
    async fn worker_acks_successful_delivery_and_mirrors_job() {
        let repo = Arc::new(MemoryJobRepository::new());
        let handler = ScriptedJobHandler::failing(0);
        let broker = Arc::new(MockBroker::reachable());

        let job = Job::new(Uuid::now_v7(), 3);
        repo.create(&job).await.unwrap();
        broker.queue_delivery(BrokerDelivery {
            receipt: "r-1".to_string(),
            job_id: job.id,
            task_id: job.task_id,
            attempt: 1,
        });

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            Arc::clone(&broker),
            Arc::clone(&repo),
            handler.clone() as Arc<dyn JobHandler>,
            EventBus::new(16),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(broker.acked(), vec!["r-1".to_string()]);
        assert!(broker.nacked().is_empty());
        let stored = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 1);
        assert!(stored.last_run_at.is_some());
    }

    #[tokio::test]
    async fn worker_nacks_failure_and_marks_failed_at_budget() {
        let repo = Arc::new(MemoryJobRepository::new());
        let handler = ScriptedJobHandler::failing(u32::MAX);
        let broker = Arc::new(MockBroker::reachable());

        let job = Job::new(Uuid::now_v7(), 3);
        repo.create(&job).await.unwrap();
        // The broker's final redelivery: attempt == max_attempts.
        broker.queue_delivery(BrokerDelivery {
            receipt: "r-9".to_string(),
            job_id: job.id,
            task_id: job.task_id,
            attempt: 3,
        });

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            Arc::clone(&broker),
            Arc::clone(&repo),
            handler.clone() as Arc<dyn JobHandler>,
            EventBus::new(16),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(broker.nacked().len(), 1);
        let stored = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 3);
        assert!(stored.last_error.is_some());
    }
}
