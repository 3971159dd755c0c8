//! Workflow execution: context, handler dispatch, the one-step engine, the
//! CRUD service surface, and the run-to-completion runner.

pub mod context;
pub mod engine;
pub mod handler;
pub mod runner;
pub mod service;

pub use context::WorkflowContext;
pub use engine::{EngineError, WorkflowEngine};
pub use handler::{StepError, StepHandler, StepHandlerRegistry};
pub use runner::WorkflowRunner;
pub use service::{ServiceError, WorkflowService};
