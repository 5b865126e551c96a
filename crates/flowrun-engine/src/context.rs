use std::collections::BTreeMap;

use serde_json::{Map, Value};

use flowrun_core::{FlowError, Result};

/// Per-execution state shared with downstream nodes.
///
/// Node outputs are append-only: each node records once, after it
/// completes, and readers only ever see completed predecessors.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    state: Map<String, Value>,
    outputs: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self {
            state: inputs,
            outputs: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> &Map<String, Value> {
        &self.state
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    /// Record a completed node's output. A second record for the same node
    /// is rejected.
    pub fn record(&mut self, node_id: &str, output: Value) -> Result<()> {
        if self.outputs.contains_key(node_id) {
            return Err(FlowError::Conflict(format!(
                "output for node '{}' already recorded",
                node_id
            )));
        }
        self.outputs.insert(node_id.to_string(), output);
        Ok(())
    }

    /// Outputs of the given nodes that have completed.
    pub fn inputs_from<'a, I>(&self, node_ids: I) -> BTreeMap<String, Value>
    where
        I: IntoIterator<Item = &'a str>,
    {
        node_ids
            .into_iter()
            .filter_map(|id| self.outputs.get(id).map(|v| (id.to_string(), v.clone())))
            .collect()
    }

    /// Merge a state definition into flow state. Existing keys win.
    pub fn apply_state_defaults(&mut self, definition: &Value) -> Result<()> {
        let defaults = match definition {
            Value::Object(map) => map,
            Value::Null => return Ok(()),
            other => {
                return Err(FlowError::Configuration(format!(
                    "stateDefinition must be an object, got {}",
                    other
                )))
            }
        };
        for (key, value) in defaults {
            self.state.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Ok(())
    }
}

/// Merge predecessor outputs into the single value a router condition sees
/// as `output`. A single predecessor is passed through as-is; several are
/// merged key-wise when they are objects, otherwise keyed by node id.
pub fn merged_output(inputs: &BTreeMap<String, Value>) -> Value {
    if inputs.len() == 1 {
        if let Some(only) = inputs.values().next() {
            return only.clone();
        }
    }
    let mut merged = Map::new();
    for (id, value) in inputs {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    merged.insert(k.clone(), v.clone());
                }
            }
            other => {
                merged.insert(id.clone(), other.clone());
            }
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outputs_are_append_only() {
        let mut ctx = ExecutionContext::default();
        ctx.record("a", json!(1)).unwrap();
        assert!(matches!(ctx.record("a", json!(2)), Err(FlowError::Conflict(_))));
        assert_eq!(ctx.output("a"), Some(&json!(1)));
    }

    #[test]
    fn test_inputs_only_from_completed() {
        let mut ctx = ExecutionContext::default();
        ctx.record("a", json!("done")).unwrap();
        let inputs = ctx.inputs_from(["a", "b"]);
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs["a"], json!("done"));
    }

    #[test]
    fn test_state_defaults_do_not_override_inputs() {
        let mut inputs = Map::new();
        inputs.insert("count".into(), json!(15));
        let mut ctx = ExecutionContext::new(inputs);
        ctx.apply_state_defaults(&json!({"count": 0, "region": "eu"})).unwrap();
        assert_eq!(ctx.state()["count"], json!(15));
        assert_eq!(ctx.state()["region"], json!("eu"));
        assert!(ctx.apply_state_defaults(&json!([1])).is_err());
    }

    #[test]
    fn test_merged_output() {
        let mut one = BTreeMap::new();
        one.insert("a".to_string(), json!("text"));
        assert_eq!(merged_output(&one), json!("text"));

        let mut two = BTreeMap::new();
        two.insert("a".to_string(), json!({"x": 1}));
        two.insert("b".to_string(), json!("plain"));
        assert_eq!(merged_output(&two), json!({"x": 1, "b": "plain"}));
    }
}
