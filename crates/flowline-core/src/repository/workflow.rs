//! Workflow repository trait definition.

use chrono::{DateTime, Utc};
use flowline_types::error::RepositoryError;
use flowline_types::workflow::{Workflow, WorkflowFilter};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Besides plain CRUD, this trait carries the lock primitive the engine
/// relies on: `try_lock` must compile to a single atomic conditional update
/// so that two concurrent runners cannot both acquire the same workflow.
pub trait WorkflowRepository: Send + Sync {
    /// Insert a new workflow record.
    fn create(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Fetch a workflow by ID.
    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// Persist the full workflow record (steps, context, status, lock).
    fn update(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List workflows matching the filter, newest first.
    fn list(
        &self,
        filter: &WorkflowFilter,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    /// Atomically take the run lock.
    ///
    /// Must perform, in one conditional update:
    /// `set locked = true, locked_at = locked_at_value, status = running`
    /// **only if** `locked == false` or the existing `locked_at` is at or
    /// before `stale_cutoff`. Returns whether the lock was acquired.
    fn try_lock(
        &self,
        id: &Uuid,
        locked_at: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Clear the lock unconditionally, leaving every other field untouched.
    ///
    /// Used on error exit paths where the engine may hold a lock but no
    /// longer trusts its in-memory copy of the record.
    fn unlock(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
