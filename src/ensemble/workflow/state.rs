// SPDX-License-Identifier: MIT

//! Run state visible to task guards
//!
//! Two top-level namespaces exist: `inputs.<key>` holds the workflow inputs
//! and `output.<task_id>` holds each finished task's output. Outputs that
//! parse as JSON are stored structurally so guards can reach into them, e.g.
//! `output.review.score > 7`.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct RunState {
    inputs: Map<String, Value>,
    outputs: Map<String, Value>,
}

impl RunState {
    pub fn new(inputs: &BTreeMap<String, Value>) -> Self {
        Self {
            inputs: inputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            outputs: Map::new(),
        }
    }

    /// Record a task's raw text output.
    pub fn record_output(&mut self, task_id: &str, output: &str) {
        let value = serde_json::from_str::<Value>(output.trim())
            .ok()
            .filter(|v| v.is_object() || v.is_array())
            .unwrap_or_else(|| Value::String(output.to_string()));
        self.outputs.insert(task_id.to_string(), value);
    }

    pub fn has_output(&self, task_id: &str) -> bool {
        self.outputs.contains_key(task_id)
    }

    /// Look up a dotted path such as `output.research.score`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let root = match parts.next()? {
            "inputs" => &self.inputs,
            "output" | "outputs" => &self.outputs,
            _ => return None,
        };
        let mut current = root.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                other => other.get(part)?,
            };
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_paths_resolve_inputs_and_outputs() {
        let mut inputs = BTreeMap::new();
        inputs.insert("topic".to_string(), json!("rust"));
        let mut state = RunState::new(&inputs);
        state.record_output("review", r#"{"score": 8, "tags": ["ok"]}"#);
        state.record_output("draft", "plain text");

        assert_eq!(state.get_path("inputs.topic"), Some(&json!("rust")));
        assert_eq!(state.get_path("output.review.score"), Some(&json!(8)));
        assert_eq!(state.get_path("output.review.tags.0"), Some(&json!("ok")));
        assert_eq!(state.get_path("output.draft"), Some(&json!("plain text")));
        assert_eq!(state.get_path("output.missing"), None);
        assert_eq!(state.get_path("unknown.path"), None);
        assert!(state.has_output("draft"));
    }

    #[test]
    fn test_scalar_json_output_stays_text() {
        let mut state = RunState::default();
        state.record_output("count", "42");
        assert_eq!(state.get_path("output.count"), Some(&json!("42")));
    }
}
