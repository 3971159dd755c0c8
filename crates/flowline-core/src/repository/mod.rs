//! Storage port definitions.
//!
//! The traits here are implemented by the infrastructure layer
//! (flowline-infra) with SQLite persistence, and by in-memory fakes in
//! tests. Uses native async fn in traits (RPITIT), no `async_trait` macro.

pub mod job;
pub mod schedule;
pub mod workflow;

pub use job::JobRepository;
pub use schedule::ScheduleRepository;
pub use workflow::WorkflowRepository;
