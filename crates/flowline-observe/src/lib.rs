//! Observability setup for Flowline.

pub mod tracing_setup;
