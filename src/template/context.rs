//! Template context for variable resolution

use crate::state::WorkflowState;
use minijinja::value::Value;
use std::collections::BTreeMap;

/// Variables available to templates and edge expressions.
///
/// Top-level names: `run_id`, `status`, `failure_reason`, `history`,
/// `last_message`, `task_queue`, `pending_tasks`, `results`, `failed_tasks`,
/// `metadata`, plus anything added with [`TemplateContext::set`].
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    vars: BTreeMap<String, serde_json::Value>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context built from the state's view
    pub fn from_state(state: &WorkflowState) -> Self {
        let mut ctx = Self::new();
        if let serde_json::Value::Object(map) = state.view() {
            ctx.vars.extend(map);
        }
        ctx
    }

    /// Add or replace a top-level variable
    pub fn set(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.set(name, value);
        self
    }

    /// Convert to a minijinja Value for template rendering
    pub fn to_value(&self) -> Value {
        Value::from_iter(
            self.vars
                .iter()
                .map(|(k, v)| (k.clone(), json_to_minijinja_value(v))),
        )
    }

    /// Get list of known top-level variable names for error suggestions
    pub fn known_variables(&self) -> Vec<&str> {
        self.vars.keys().map(String::as_str).collect()
    }
}

fn json_to_minijinja_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::from(()),
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(f) = n.as_f64() {
                Value::from(f)
            } else {
                Value::from(n.to_string())
            }
        }
        serde_json::Value::String(s) => Value::from(s.clone()),
        serde_json::Value::Array(arr) => {
            Value::from(arr.iter().map(json_to_minijinja_value).collect::<Vec<_>>())
        }
        serde_json::Value::Object(obj) => {
            let map: BTreeMap<String, Value> = obj
                .iter()
                .map(|(k, v)| (k.clone(), json_to_minijinja_value(v)))
                .collect();
            Value::from_iter(map)
        }
    }
}
