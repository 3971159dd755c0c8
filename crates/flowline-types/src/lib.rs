//! Shared domain types for Flowline.
//!
//! This crate contains the persisted entities of the orchestration core --
//! Workflow, Job, Schedule -- plus the event and configuration types shared
//! across the workspace.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, uuid, chrono,
//! thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod schedule;
pub mod workflow;
