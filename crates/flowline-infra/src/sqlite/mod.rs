//! SQLite persistence layer.

pub mod job;
pub mod pool;
pub mod schedule;
pub mod workflow;

pub use job::SqliteJobRepository;
pub use pool::DatabasePool;
pub use schedule::SqliteScheduleRepository;
pub use workflow::SqliteWorkflowRepository;

use chrono::{DateTime, Utc};
use flowline_types::error::RepositoryError;
use uuid::Uuid;

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}
