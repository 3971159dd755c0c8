//! Workflow execution context with step result tracking and template
//! resolution.
//!
//! `WorkflowContext` is the mutable state that flows through a workflow. It
//! stores each step's result under the step id, keeps the most recent result
//! in a reserved last-result slot, and carries seed variables supplied at
//! workflow creation. Size limits prevent unbounded growth of the persisted
//! record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step result (1 MB).
pub const MAX_STEP_RESULT_SIZE: usize = 1_048_576;

/// Maximum total serialized size of the context (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Context growth or restore failure.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("total context size ({actual} bytes) exceeds maximum ({max} bytes)")]
    TooLarge { actual: usize, max: usize },

    #[error("failed to restore context: {0}")]
    Restore(String),
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Mutable state threaded through a workflow's steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// Results of completed steps, keyed by step id.
    #[serde(default)]
    pub step_results: HashMap<String, Value>,
    /// Seed data supplied at workflow creation; read-only to the engine.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// The reserved slot holding the most recent step result.
    #[serde(default)]
    pub last_result: Option<Value>,
}

impl WorkflowContext {
    /// A context seeded with the given variables.
    pub fn with_variables(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            ..Self::default()
        }
    }

    /// Merge a step result under the step id and the last-result slot.
    ///
    /// Oversized results are replaced by a truncation marker so one noisy
    /// step cannot blow up the persisted record; the total-size cap is a
    /// hard error.
    pub fn merge_step_result(
        &mut self,
        step_id: &str,
        result: Value,
    ) -> Result<(), ContextError> {
        let size = serialized_size(&result);
        let stored = if size > MAX_STEP_RESULT_SIZE {
            tracing::warn!(
                step_id,
                size,
                max = MAX_STEP_RESULT_SIZE,
                "step result exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": size,
            })
        } else {
            result
        };

        self.step_results
            .insert(step_id.to_string(), stored.clone());
        self.last_result = Some(stored);

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::TooLarge {
                actual: total,
                max: MAX_CONTEXT_SIZE,
            });
        }
        Ok(())
    }

    /// Result of a completed step, if present.
    pub fn step_result(&self, step_id: &str) -> Option<&Value> {
        self.step_results.get(step_id)
    }

    /// Discard accumulated results (used by workflow reset). Seed variables
    /// survive.
    pub fn clear_results(&mut self) {
        self.step_results.clear();
        self.last_result = None;
    }

    /// Total serialized size of the context in bytes.
    pub fn total_size(&self) -> usize {
        let results: usize = self.step_results.values().map(serialized_size).sum();
        let variables: usize = self.variables.values().map(serialized_size).sum();
        let last = self.last_result.as_ref().map(serialized_size).unwrap_or(0);
        results + variables + last
    }

    /// Serialize for persistence on the workflow record.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(json!({}))
    }

    /// Restore from a persisted workflow record.
    pub fn from_json(value: Value) -> Result<Self, ContextError> {
        serde_json::from_value(value).map_err(|e| ContextError::Restore(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Template resolution
    // -----------------------------------------------------------------------

    /// Resolve `{{ steps.<id> }}`, `{{ last_result }}`, and
    /// `{{ variables.<name> }}` placeholders in a string. Unknown references
    /// are left as-is.
    pub fn resolve_template(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(end_rel) = rest[start..].find("}}") else {
                break;
            };
            let end = start + end_rel;
            let expr = rest[start + 2..end].trim();

            out.push_str(&rest[..start]);
            match self.lookup(expr) {
                Some(value) => out.push_str(&value_to_string(value)),
                None => out.push_str(&rest[start..end + 2]),
            }
            rest = &rest[end + 2..];
        }
        out.push_str(rest);
        out
    }

    /// Resolve templates in every string leaf of a config value.
    pub fn resolve_config(&self, config: &Value) -> Value {
        match config {
            Value::String(s) => Value::String(self.resolve_template(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_config(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_config(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn lookup(&self, expr: &str) -> Option<&Value> {
        if expr == "last_result" {
            return self.last_result.as_ref();
        }
        if let Some(step_id) = expr.strip_prefix("steps.") {
            return self.step_results.get(step_id);
        }
        if let Some(name) = expr.strip_prefix("variables.") {
            return self.variables.get(name);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn serialized_size(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

/// Convert a JSON value to a display string for template resolution.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // objects/arrays become compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
