//! Step handler contract and registry.
//!
//! A `StepHandler` executes one kind of step (`http`, `email`, `transform`,
//! ...) against an opaque config and the workflow context. The registry is an
//! instance owned by the engine/service -- constructor-injected, never a
//! module-level singleton -- and step types are checked against it at
//! registration and workflow-creation time rather than at dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use super::context::WorkflowContext;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of a step handler invocation.
///
/// The class decides retry behavior: transient failures consume the step's
/// retry budget, permanent ones fail the workflow immediately.
#[derive(Debug, Error)]
pub enum StepError {
    /// Network/timeout/connection-class failure; worth retrying.
    #[error("transient step failure: {0}")]
    Transient(String),

    /// A failure retrying will not fix (bad config, rejected input).
    #[error("permanent step failure: {0}")]
    Permanent(String),
}

impl StepError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }
}

/// Registry construction/lookup failure.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("step type '{0}' is already registered")]
    Duplicate(String),

    #[error("no handler registered for step type '{0}'")]
    UnknownStepType(String),
}

// ---------------------------------------------------------------------------
// StepHandler
// ---------------------------------------------------------------------------

/// Executes one kind of step.
///
/// Handlers must be side-effect-free with respect to engine internals: they
/// read `config` and `context` and return a result value; all persistence is
/// the engine's job. Failures propagate as `StepError` and are captured into
/// the workflow's `last_error`.
pub trait StepHandler: Send + Sync {
    /// Run the step. `config` has already had context templates resolved.
    fn execute<'a>(
        &'a self,
        config: &'a Value,
        context: &'a WorkflowContext,
    ) -> BoxFuture<'a, Result<Value, StepError>>;
}

// ---------------------------------------------------------------------------
// StepHandlerRegistry
// ---------------------------------------------------------------------------

/// Maps step types to their handlers.
#[derive(Default)]
pub struct StepHandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a step type. Duplicate registration is a
    /// wiring bug and is rejected.
    pub fn register(
        &mut self,
        step_type: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) -> Result<(), RegistryError> {
        let step_type = step_type.into();
        if self.handlers.contains_key(&step_type) {
            return Err(RegistryError::Duplicate(step_type));
        }
        tracing::debug!(step_type = step_type.as_str(), "step handler registered");
        self.handlers.insert(step_type, handler);
        Ok(())
    }

    /// Look up the handler for a step type.
    pub fn get(&self, step_type: &str) -> Option<&Arc<dyn StepHandler>> {
        self.handlers.get(step_type)
    }

    /// Whether a step type has a handler.
    pub fn contains(&self, step_type: &str) -> bool {
        self.handlers.contains_key(step_type)
    }

    /// Check that every given step type is routable.
    pub fn ensure_routable<'a>(
        &self,
        step_types: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), RegistryError> {
        for step_type in step_types {
            if !self.contains(step_type) {
                return Err(RegistryError::UnknownStepType(step_type.to_string()));
            }
        }
        Ok(())
    }

    /// Registered step types, for diagnostics.
    pub fn step_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for StepHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepHandlerRegistry")
            .field("step_types", &self.step_types())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    impl StepHandler for EchoHandler {
        fn execute<'a>(
            &'a self,
            config: &'a Value,
            _context: &'a WorkflowContext,
        ) -> BoxFuture<'a, Result<Value, StepError>> {
            Box::pin(async move { Ok(config.clone()) })
        }
    }

    fn echo_handler() -> Arc<dyn StepHandler> {
        Arc::new(EchoHandler)
    }

    #[tokio::test]
    async fn registered_handler_is_dispatchable() {
        let mut registry = StepHandlerRegistry::new();
        registry.register("echo", echo_handler()).unwrap();

        let handler = registry.get("echo").unwrap();
        let out = handler
            .execute(&json!({ "msg": "hi" }), &WorkflowContext::default())
            .await
            .unwrap();
        assert_eq!(out, json!({ "msg": "hi" }));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = StepHandlerRegistry::new();
        registry.register("echo", echo_handler()).unwrap();

        let err = registry.register("echo", echo_handler()).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(t) if t == "echo"));
    }

    #[test]
    fn ensure_routable_flags_unknown_types() {
        let mut registry = StepHandlerRegistry::new();
        registry.register("http", echo_handler()).unwrap();

        assert!(registry.ensure_routable(["http"]).is_ok());
        let err = registry.ensure_routable(["http", "email"]).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownStepType(t) if t == "email"));
    }

    #[test]
    fn step_error_classification() {
        assert!(StepError::Transient("timeout".into()).is_transient());
        assert!(!StepError::Permanent("bad config".into()).is_transient());
    }
}
