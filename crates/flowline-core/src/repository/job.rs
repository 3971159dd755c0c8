//! Job repository trait definition.

use chrono::{DateTime, Utc};
use flowline_types::error::RepositoryError;
use flowline_types::job::Job;
use uuid::Uuid;

/// Repository trait for job persistence.
pub trait JobRepository: Send + Sync {
    /// Insert a new job record.
    fn create(
        &self,
        job: &Job,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Fetch a job by ID.
    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Job>, RepositoryError>> + Send;

    /// Persist the full job record.
    fn update(
        &self,
        job: &Job,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Jobs with `status = pending` and `next_run_at <= now`, oldest due
    /// first, capped at `limit`.
    fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Job>, RepositoryError>> + Send;
}
