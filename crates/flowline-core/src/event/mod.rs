//! Event distribution for orchestrator lifecycle events.

pub mod bus;

pub use bus::EventBus;
