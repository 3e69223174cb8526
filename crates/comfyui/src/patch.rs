//! Seed and parameter injection for API-format ComfyUI workflows.
//!
//! An API-format workflow is a JSON object keyed by node id:
//!
//! ```json
//! {"3": {"class_type": "KSampler", "inputs": {"seed": 0, "steps": 20, "model": ["4", 0]}}}
//! ```
//!
//! Inputs whose value is a `[node_id, output_index]` array are links to
//! other nodes and are never overwritten.

use renderfarm_core::backend::{JobSpecPatcher, PatchError};
use renderfarm_core::job_group::{JobSpec, Parameters};
use renderfarm_core::types::Seed;
use serde_json::{Map, Value};

/// Input names that receive the child's seed.
pub const DEFAULT_SEED_INPUTS: &[&str] = &["seed", "noise_seed"];

/// [`JobSpecPatcher`] for ComfyUI workflows.
///
/// Parameter keys are either `"<node_id>.<input>"`, which sets one input on
/// one node, or a bare `"<input>"`, which sets that input on every node
/// that already has it. The seed is applied last so that every child
/// keeps its own seed.
#[derive(Debug, Clone)]
pub struct ComfyUIPatcher {
    seed_inputs: Vec<String>,
}

impl ComfyUIPatcher {
    pub fn new(seed_inputs: Vec<String>) -> Self {
        Self { seed_inputs }
    }
}

impl Default for ComfyUIPatcher {
    fn default() -> Self {
        Self::new(DEFAULT_SEED_INPUTS.iter().map(|s| s.to_string()).collect())
    }
}

impl JobSpecPatcher for ComfyUIPatcher {
    fn patch_seed(
        &self,
        spec: &JobSpec,
        seed: Seed,
        parameters: &Parameters,
    ) -> Result<JobSpec, PatchError> {
        let mut graph = spec.as_value().clone();
        let nodes = graph
            .as_object_mut()
            .ok_or_else(|| PatchError("Workflow must be a JSON object keyed by node id".into()))?;

        for (key, value) in parameters {
            apply_parameter(nodes, key, value)?;
        }

        let mut seeded = 0usize;
        for inputs in nodes.values_mut().filter_map(node_inputs) {
            for name in &self.seed_inputs {
                if set_if_present(inputs, name, Value::from(seed)) {
                    seeded += 1;
                }
            }
        }
        if seeded == 0 {
            tracing::debug!(seed, "Workflow has no seed inputs; submitting unchanged seed");
        }

        Ok(JobSpec::new(graph))
    }
}

fn apply_parameter(nodes: &mut Map<String, Value>, key: &str, value: &Value) -> Result<(), PatchError> {
    match key.split_once('.') {
        Some((node_id, input)) => {
            let node = nodes.get_mut(node_id).ok_or_else(|| {
                PatchError(format!("Parameter '{key}' targets unknown node '{node_id}'"))
            })?;
            let inputs = node_inputs(node).ok_or_else(|| {
                PatchError(format!("Node '{node_id}' has no inputs object"))
            })?;
            if is_link(inputs.get(input)) {
                return Err(PatchError(format!(
                    "Parameter '{key}' would overwrite a node link"
                )));
            }
            inputs.insert(input.to_string(), value.clone());
        }
        None => {
            let mut matched = 0usize;
            for inputs in nodes.values_mut().filter_map(node_inputs) {
                if set_if_present(inputs, key, value.clone()) {
                    matched += 1;
                }
            }
            if matched == 0 {
                tracing::debug!(parameter = key, "Parameter matched no node inputs");
            }
        }
    }
    Ok(())
}

fn node_inputs(node: &mut Value) -> Option<&mut Map<String, Value>> {
    node.get_mut("inputs")?.as_object_mut()
}

/// Overwrite `name` if it exists and is a literal. Returns whether it was set.
fn set_if_present(inputs: &mut Map<String, Value>, name: &str, value: Value) -> bool {
    match inputs.get_mut(name) {
        Some(slot) if !slot.is_array() => {
            *slot = value;
            true
        }
        _ => false,
    }
}

fn is_link(value: Option<&Value>) -> bool {
    value.is_some_and(Value::is_array)
}
