//! Schedule repository trait definition.

use chrono::{DateTime, Utc};
use flowline_types::error::RepositoryError;
use flowline_types::schedule::Schedule;
use uuid::Uuid;

/// Repository trait for schedule persistence.
pub trait ScheduleRepository: Send + Sync {
    /// Insert a new schedule record.
    fn create(
        &self,
        schedule: &Schedule,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Fetch a schedule by ID.
    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Schedule>, RepositoryError>> + Send;

    /// Persist the full schedule record.
    fn update(
        &self,
        schedule: &Schedule,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete a schedule. Returns `true` if it existed.
    fn delete(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// All schedules, enabled or not.
    fn list(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Schedule>, RepositoryError>> + Send;

    /// Schedules with `enabled = true` (the initialization set).
    fn list_enabled(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Schedule>, RepositoryError>> + Send;

    /// Flip the enabled flag without touching the rest of the record.
    fn set_enabled(
        &self,
        id: &Uuid,
        enabled: bool,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Record a trigger fire time.
    fn touch_last_run(
        &self,
        id: &Uuid,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
