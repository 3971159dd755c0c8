//! Durable job queue with a pluggable broker backend and an in-process
//! fallback.
//!
//! Every enqueue creates a persisted `Job` record and hands the work to the
//! active backend. Which backend runs is an explicit, logged startup
//! decision driven by configuration -- never a silent behavior switch: the
//! selection is traced, published on the event bus, and the in-process
//! backend announces that it is single-node only.

pub mod broker;
pub mod in_process;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use flowline_types::config::{QueueBackendChoice, QueueConfig};
use flowline_types::event::OrchestratorEvent;
use flowline_types::job::{Job, JobStatus};
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::JobRepository;
use crate::resilience::{CircuitBreaker, CircuitBreakerError, RetryPolicy};

pub use broker::{BrokerClient, BrokerDelivery, BrokerError, BrokerPush};
pub use in_process::InProcessPoller;

/// Priority used when an operator explicitly retries a failed job.
pub const RETRY_PRIORITY: u8 = 10;

// ---------------------------------------------------------------------------
// Job handler contract
// ---------------------------------------------------------------------------

/// Failure reported by a job handler.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct JobFailure(pub String);

/// The unit of work a job executes -- in practice, running a workflow by id
/// through the `WorkflowRunner`.
pub trait JobHandler: Send + Sync {
    fn run_task(&self, task_id: Uuid) -> BoxFuture<'_, Result<(), JobFailure>>;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("job {job_id} is {status} and cannot be retried")]
    InvalidState { job_id: Uuid, status: &'static str },

    #[error("broker backend required but unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("repository error: {0}")]
    Repository(#[from] flowline_types::error::RepositoryError),
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

type PushFn = Arc<dyn Fn(BrokerPush) -> BoxFuture<'static, Result<(), BrokerError>> + Send + Sync>;

enum Backend {
    /// Distributed broker: durability and retry semantics delegated.
    Broker {
        push: PushFn,
        max_attempts: u32,
        backoff_base: Duration,
    },
    /// Single-process poller.
    InProcess,
}

impl Backend {
    fn name(&self) -> &'static str {
        match self {
            Backend::Broker { .. } => "broker",
            Backend::InProcess => "in_process",
        }
    }
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

/// Durable enqueue/execute facade over the selected backend.
pub struct JobQueue<R: JobRepository> {
    repo: Arc<R>,
    events: EventBus,
    default_max_attempts: u32,
    backend: Backend,
    cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<R: JobRepository + 'static> JobQueue<R> {
    /// Select a backend per configuration and start it.
    ///
    /// - `in_process`: poller, no broker probe.
    /// - `broker`: the broker must answer a ping or startup fails.
    /// - `auto`: probe the broker; on failure fall back to the in-process
    ///   poller with a warning.
    pub async fn start<C>(
        config: &QueueConfig,
        repo: Arc<R>,
        handler: Arc<dyn JobHandler>,
        broker: Option<Arc<C>>,
        events: EventBus,
    ) -> Result<Self, QueueError>
    where
        C: BrokerClient + 'static,
    {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let backend = match (config.backend, broker) {
            (QueueBackendChoice::InProcess, _) => {
                tracing::info!(
                    "job queue backend: in-process poller (forced by configuration); \
                     this backend is single-node only"
                );
                Backend::InProcess
            }
            (QueueBackendChoice::Broker, None) => {
                return Err(QueueError::BrokerUnavailable(
                    "backend = broker but no broker client is configured".to_string(),
                ));
            }
            (QueueBackendChoice::Broker, Some(client)) => {
                client
                    .ping()
                    .await
                    .map_err(|e| QueueError::BrokerUnavailable(e.to_string()))?;
                tracing::info!("job queue backend: broker (required by configuration)");
                Self::broker_backend(config, client, &repo, &handler, &events, &cancel, &mut tasks)
            }
            (QueueBackendChoice::Auto, Some(client)) => match client.ping().await {
                Ok(()) => {
                    tracing::info!("job queue backend: broker (probe succeeded)");
                    Self::broker_backend(
                        config, client, &repo, &handler, &events, &cancel, &mut tasks,
                    )
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        "broker unreachable, falling back to the in-process poller; \
                         this backend is single-node only"
                    );
                    Backend::InProcess
                }
            },
            (QueueBackendChoice::Auto, None) => {
                tracing::warn!(
                    "no broker client configured, using the in-process poller; \
                     this backend is single-node only"
                );
                Backend::InProcess
            }
        };

        if matches!(backend, Backend::InProcess) {
            let poller = InProcessPoller::new(
                Arc::clone(&repo),
                Arc::clone(&handler),
                events.clone(),
                Duration::from_secs(config.poll_interval_secs),
            );
            tasks.push(tokio::spawn(poller.run(cancel.clone())));
        }

        events.publish(OrchestratorEvent::QueueBackendSelected {
            backend: backend.name().to_string(),
        });

        Ok(Self {
            repo,
            events,
            default_max_attempts: config.default_max_attempts,
            backend,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Wire the broker backend: a worker task plus a push function guarded
    /// by the resilience leaves (retry on transient errors, circuit breaker
    /// around the whole call).
    fn broker_backend<C>(
        config: &QueueConfig,
        client: Arc<C>,
        repo: &Arc<R>,
        handler: &Arc<dyn JobHandler>,
        events: &EventBus,
        cancel: &CancellationToken,
        tasks: &mut Vec<tokio::task::JoinHandle<()>>,
    ) -> Backend
    where
        C: BrokerClient + 'static,
    {
        tasks.push(tokio::spawn(broker::run_worker(
            Arc::clone(&client),
            Arc::clone(repo),
            Arc::clone(handler),
            events.clone(),
            Duration::from_secs(config.broker.pull_wait_secs),
            cancel.clone(),
        )));

        let breaker = Arc::new(CircuitBreaker::new(
            format!("broker:{}", config.broker.queue),
            Default::default(),
        ));
        let policy = RetryPolicy::new(2, Duration::from_millis(500))
            .with_factor(2.0)
            .with_jitter();

        let push: PushFn = Arc::new(move |submission: BrokerPush| {
            let client = Arc::clone(&client);
            let breaker = Arc::clone(&breaker);
            let policy = policy.clone();
            Box::pin(async move {
                let outcome = breaker
                    .execute(|| {
                        policy.run_with(
                            || client.push(&submission),
                            BrokerError::is_transient,
                            |err, attempt| {
                                tracing::warn!(
                                    job_id = %submission.job_id,
                                    attempt,
                                    error = %err,
                                    "broker push retry"
                                );
                            },
                        )
                    })
                    .await;
                outcome.map_err(|err| match err {
                    CircuitBreakerError::Open(name) => BrokerError::CircuitOpen(name),
                    CircuitBreakerError::Inner(inner) => inner,
                })
            })
        });

        Backend::Broker {
            push,
            max_attempts: config.default_max_attempts,
            backoff_base: Duration::from_secs(config.broker.backoff_base_secs),
        }
    }

    /// The name of the active backend (`broker` / `in_process`).
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Create a persisted job and hand it to the active backend.
    pub async fn enqueue(&self, task_id: Uuid, priority: u8) -> Result<Uuid, QueueError> {
        let job = Job::new(task_id, self.default_max_attempts);
        self.repo.create(&job).await?;

        if let Backend::Broker {
            push,
            max_attempts,
            backoff_base,
        } = &self.backend
        {
            let submitted = push(BrokerPush {
                job_id: job.id,
                task_id,
                priority,
                max_attempts: *max_attempts,
                backoff_base: *backoff_base,
            })
            .await;

            if let Err(err) = submitted {
                // The job record stays behind as `failed` so an operator can
                // see it and re-submit via retry_job once the broker is back.
                let mut orphan = job;
                orphan.status = JobStatus::Failed;
                orphan.last_error = Some(format!("broker push failed: {err}"));
                orphan.updated_at = Utc::now();
                self.repo.update(&orphan).await?;
                return Err(QueueError::Broker(err));
            }
        }

        tracing::debug!(job_id = %job.id, task_id = %task_id, priority, "job enqueued");
        self.events.publish(OrchestratorEvent::JobEnqueued {
            job_id: job.id,
            task_id,
            priority,
        });
        Ok(job.id)
    }

    /// Re-submit a failed job with a fresh attempt budget and elevated
    /// priority. Only `failed` jobs are eligible.
    pub async fn retry_job(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut job = self
            .repo
            .get(&job_id)
            .await?
            .ok_or(QueueError::NotFound(job_id))?;

        if job.status != JobStatus::Failed {
            return Err(QueueError::InvalidState {
                job_id,
                status: job.status.as_str(),
            });
        }

        job.attempts = 0;
        job.status = JobStatus::Pending;
        job.next_run_at = Utc::now();
        job.last_error = None;
        job.updated_at = Utc::now();
        self.repo.update(&job).await?;

        if let Backend::Broker {
            push,
            max_attempts,
            backoff_base,
        } = &self.backend
        {
            push(BrokerPush {
                job_id: job.id,
                task_id: job.task_id,
                priority: RETRY_PRIORITY,
                max_attempts: *max_attempts,
                backoff_base: *backoff_base,
            })
            .await?;
        }

        tracing::info!(job_id = %job_id, "job re-queued");
        self.events.publish(OrchestratorEvent::JobEnqueued {
            job_id: job.id,
            task_id: job.task_id,
            priority: RETRY_PRIORITY,
        });
        Ok(())
    }

    /// Fetch a job record.
    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self.repo.get(&job_id).await?)
    }

    /// Stop the backend tasks and wait for them to drain.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().expect("task list poisoned").drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "queue task join failed");
            }
        }
        tracing::info!("job queue stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryJobRepository, MockBroker, ScriptedJobHandler};

    fn config(backend: QueueBackendChoice) -> QueueConfig {
        QueueConfig {
            backend,
            poll_interval_secs: 3600, // keep the background poller quiet in tests
            ..Default::default()
        }
    }

    async fn queue_with(
        backend: QueueBackendChoice,
        broker: Option<Arc<MockBroker>>,
    ) -> JobQueue<MemoryJobRepository> {
        JobQueue::start(
            &config(backend),
            Arc::new(MemoryJobRepository::new()),
            ScriptedJobHandler::failing(0) as Arc<dyn JobHandler>,
            broker,
            EventBus::new(16),
        )
        .await
        .unwrap()
    }

    // -----------------------------------------------------------------------
    // Backend selection
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn forced_in_process_ignores_broker() {
        let queue = queue_with(
            QueueBackendChoice::InProcess,
            Some(Arc::new(MockBroker::reachable())),
        )
        .await;
        assert_eq!(queue.backend_name(), "in_process");
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn auto_selects_broker_when_reachable() {
        let queue = queue_with(
            QueueBackendChoice::Auto,
            Some(Arc::new(MockBroker::reachable())),
        )
        .await;
        assert_eq!(queue.backend_name(), "broker");
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn auto_falls_back_when_broker_unreachable() {
        let queue = queue_with(
            QueueBackendChoice::Auto,
            Some(Arc::new(MockBroker::unreachable())),
        )
        .await;
        assert_eq!(queue.backend_name(), "in_process");
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn required_broker_unreachable_fails_startup() {
        let result = JobQueue::start(
            &config(QueueBackendChoice::Broker),
            Arc::new(MemoryJobRepository::new()),
            ScriptedJobHandler::failing(0) as Arc<dyn JobHandler>,
            Some(Arc::new(MockBroker::unreachable())),
            EventBus::new(16),
        )
        .await;
        assert!(matches!(result, Err(QueueError::BrokerUnavailable(_))));
    }

    #[tokio::test]
    async fn backend_selection_is_published() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let queue = JobQueue::start(
            &config(QueueBackendChoice::InProcess),
            Arc::new(MemoryJobRepository::new()),
            ScriptedJobHandler::failing(0) as Arc<dyn JobHandler>,
            None::<Arc<MockBroker>>,
            events,
        )
        .await
        .unwrap();

        let event = rx.recv().await.unwrap();
        match event {
            OrchestratorEvent::QueueBackendSelected { backend } => {
                assert_eq!(backend, "in_process")
            }
            other => panic!("unexpected event: {other:?}"),
        }
        queue.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn enqueue_persists_pending_job() {
        let repo = Arc::new(MemoryJobRepository::new());
        let queue = JobQueue::start(
            &config(QueueBackendChoice::InProcess),
            Arc::clone(&repo),
            ScriptedJobHandler::failing(0) as Arc<dyn JobHandler>,
            None::<Arc<MockBroker>>,
            EventBus::new(16),
        )
        .await
        .unwrap();

        let task_id = Uuid::now_v7();
        let job_id = queue.enqueue(task_id, 5).await.unwrap();

        let stored = repo.get(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.task_id, task_id);
        assert!(stored.next_run_at <= Utc::now());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn enqueue_pushes_to_broker_with_priority() {
        let broker = Arc::new(MockBroker::reachable());
        let repo = Arc::new(MemoryJobRepository::new());
        let queue = JobQueue::start(
            &config(QueueBackendChoice::Broker),
            Arc::clone(&repo),
            ScriptedJobHandler::failing(0) as Arc<dyn JobHandler>,
            Some(Arc::clone(&broker)),
            EventBus::new(16),
        )
        .await
        .unwrap();

        let task_id = Uuid::now_v7();
        let job_id = queue.enqueue(task_id, 5).await.unwrap();

        let pushes = broker.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].job_id, job_id);
        assert_eq!(pushes[0].priority, 5);
        assert_eq!(pushes[0].max_attempts, 3);
        assert_eq!(pushes[0].backoff_base, Duration::from_secs(5));
        queue.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // retry_job (Scenario: failed -> pending, attempts reset)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn retry_job_resets_failed_job() {
        let repo = Arc::new(MemoryJobRepository::new());
        let queue = JobQueue::start(
            &config(QueueBackendChoice::InProcess),
            Arc::clone(&repo),
            ScriptedJobHandler::failing(0) as Arc<dyn JobHandler>,
            None::<Arc<MockBroker>>,
            EventBus::new(16),
        )
        .await
        .unwrap();

        let job_id = queue.enqueue(Uuid::now_v7(), 5).await.unwrap();
        let mut job = repo.get(&job_id).await.unwrap().unwrap();
        job.status = JobStatus::Failed;
        job.attempts = 3;
        job.last_error = Some("boom".to_string());
        repo.update(&job).await.unwrap();

        queue.retry_job(job_id).await.unwrap();

        let stored = repo.get(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 0);
        assert!(stored.last_error.is_none());
        assert!(stored.next_run_at <= Utc::now());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn retry_job_rejects_non_failed_job() {
        let repo = Arc::new(MemoryJobRepository::new());
        let queue = JobQueue::start(
            &config(QueueBackendChoice::InProcess),
            Arc::clone(&repo),
            ScriptedJobHandler::failing(0) as Arc<dyn JobHandler>,
            None::<Arc<MockBroker>>,
            EventBus::new(16),
        )
        .await
        .unwrap();

        let job_id = queue.enqueue(Uuid::now_v7(), 5).await.unwrap();
        let err = queue.retry_job(job_id).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { status: "pending", .. }));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn retry_job_unknown_id_is_not_found() {
        let queue = queue_with(QueueBackendChoice::InProcess, None).await;
        let missing = Uuid::now_v7();
        let err = queue.retry_job(missing).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(id) if id == missing));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn retry_job_resubmits_with_elevated_priority() {
        let broker = Arc::new(MockBroker::reachable());
        let repo = Arc::new(MemoryJobRepository::new());
        let queue = JobQueue::start(
            &config(QueueBackendChoice::Broker),
            Arc::clone(&repo),
            ScriptedJobHandler::failing(0) as Arc<dyn JobHandler>,
            Some(Arc::clone(&broker)),
            EventBus::new(16),
        )
        .await
        .unwrap();

        let job_id = queue.enqueue(Uuid::now_v7(), 5).await.unwrap();
        let mut job = repo.get(&job_id).await.unwrap().unwrap();
        job.status = JobStatus::Failed;
        repo.update(&job).await.unwrap();

        queue.retry_job(job_id).await.unwrap();

        let pushes = broker.pushes();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[1].priority, RETRY_PRIORITY);
        queue.shutdown().await;
    }
}
