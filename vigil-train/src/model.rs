//! Model collaborator boundary.
//!
//! The engine never looks inside a model: it saves and restores named
//! parameter tensors, calls the forward pass, and reads the task descriptor
//! that fixes the label schema.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::device::Placeable;
use vigil_core::{Result, VigilError};

/// Named, flattened parameter tensors.
pub type StateDict = BTreeMap<String, Vec<f64>>;

/// Label schema the model was built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskDescriptor {
    Classification {
        class_names: Vec<String>,
        #[serde(default = "default_input_key")]
        input_key: String,
        #[serde(default = "default_label_key")]
        label_key: String,
        #[serde(default)]
        meta_keys: Vec<String>,
    },
    Generic {
        name: String,
    },
}

fn default_input_key() -> String {
    "input".to_string()
}

fn default_label_key() -> String {
    "label".to_string()
}

impl TaskDescriptor {
    pub fn classification<S: Into<String>>(class_names: impl IntoIterator<Item = S>) -> Self {
        Self::Classification {
            class_names: class_names.into_iter().map(Into::into).collect(),
            input_key: default_input_key(),
            label_key: default_label_key(),
            meta_keys: Vec::new(),
        }
    }

    pub fn is_classification(&self) -> bool {
        matches!(self, Self::Classification { .. })
    }

    /// Class names in index order; empty for non-classification tasks.
    pub fn class_names(&self) -> &[String] {
        match self {
            Self::Classification { class_names, .. } => class_names,
            Self::Generic { .. } => &[],
        }
    }

    pub fn class_index(&self, name: &str) -> Option<usize> {
        self.class_names().iter().position(|c| c == name)
    }
}

/// A trainable model as seen by the orchestrator.
pub trait Model: Placeable {
    fn task(&self) -> &TaskDescriptor;

    /// Snapshot of every parameter tensor.
    fn state_dict(&self) -> StateDict;

    /// Restore parameters from a snapshot taken from the same architecture.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;

    fn forward(&self, input: &[f64]) -> Vec<f64>;
}

/// Models whose gradients can be computed by the built-in executors.
pub trait Differentiable: Model {
    fn parameters_mut(&mut self) -> &mut StateDict;

    /// Parameter gradients for one sample, given the gradient of the loss
    /// with respect to the model output.
    fn backward(&self, input: &[f64], output_grad: &[f64]) -> StateDict;
}

/// Dense linear classifier `y = W x + b`, stored as `weight` (row-major,
/// `outputs x inputs`) and `bias`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    task: TaskDescriptor,
    inputs: usize,
    outputs: usize,
    params: StateDict,
}

impl LinearModel {
    /// Zero-initialized linear model with one output per task class.
    pub fn new(task: TaskDescriptor, inputs: usize) -> Self {
        let outputs = task.class_names().len().max(1);
        Self::with_outputs(task, inputs, outputs)
    }

    pub fn with_outputs(task: TaskDescriptor, inputs: usize, outputs: usize) -> Self {
        let mut params = StateDict::new();
        params.insert("weight".to_string(), vec![0.0; inputs * outputs]);
        params.insert("bias".to_string(), vec![0.0; outputs]);
        Self {
            task,
            inputs,
            outputs,
            params,
        }
    }

    fn tensor(&self, name: &str) -> &[f64] {
        self.params.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Placeable for LinearModel {}

impl Model for LinearModel {
    fn task(&self) -> &TaskDescriptor {
        &self.task
    }

    fn state_dict(&self) -> StateDict {
        self.params.clone()
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        for (name, current) in &self.params {
            let incoming = state.get(name).ok_or_else(|| {
                VigilError::invalid_state(format!("state dict missing tensor '{name}'"))
            })?;
            if incoming.len() != current.len() {
                return Err(VigilError::invalid_state(format!(
                    "tensor '{name}' has {} values, expected {}",
                    incoming.len(),
                    current.len()
                )));
            }
        }
        for (name, values) in &mut self.params {
            if let Some(incoming) = state.get(name) {
                values.clone_from(incoming);
            }
        }
        Ok(())
    }

    fn forward(&self, input: &[f64]) -> Vec<f64> {
        let weight = self.tensor("weight");
        let bias = self.tensor("bias");
        (0..self.outputs)
            .map(|o| {
                let row = &weight[o * self.inputs..(o + 1) * self.inputs];
                let dot: f64 = row.iter().zip(input).map(|(w, x)| w * x).sum();
                dot + bias.get(o).copied().unwrap_or(0.0)
            })
            .collect()
    }
}

impl Differentiable for LinearModel {
    fn parameters_mut(&mut self) -> &mut StateDict {
        &mut self.params
    }

    fn backward(&self, input: &[f64], output_grad: &[f64]) -> StateDict {
        let mut weight = vec![0.0; self.inputs * self.outputs];
        for (o, g) in output_grad.iter().enumerate().take(self.outputs) {
            for (i, x) in input.iter().enumerate().take(self.inputs) {
                weight[o * self.inputs + i] = g * x;
            }
        }
        let mut grads = StateDict::new();
        grads.insert("weight".to_string(), weight);
        grads.insert("bias".to_string(), output_grad.to_vec());
        grads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_task_lookup() {
        let task = TaskDescriptor::classification(["cat", "dog"]);
        assert!(task.is_classification());
        assert_eq!(task.class_index("dog"), Some(1));
        assert_eq!(task.class_index("bird"), None);

        let generic = TaskDescriptor::Generic { name: "regression".into() };
        assert!(generic.class_names().is_empty());
    }

    #[test]
    fn test_task_serde_tag() {
        let task = TaskDescriptor::classification(["a"]);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"], "classification");
        assert_eq!(json["input_key"], "input");
        let back: TaskDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_linear_forward_and_backward() {
        let mut model = LinearModel::new(TaskDescriptor::classification(["a", "b"]), 2);
        let mut state = model.state_dict();
        state.insert("weight".into(), vec![1.0, 2.0, 3.0, 4.0]);
        state.insert("bias".into(), vec![0.5, -0.5]);
        model.load_state_dict(&state).unwrap();

        assert_eq!(model.forward(&[1.0, 1.0]), vec![3.5, 6.5]);

        let grads = model.backward(&[2.0, 3.0], &[1.0, -1.0]);
        assert_eq!(grads["weight"], vec![2.0, 3.0, -2.0, -3.0]);
        assert_eq!(grads["bias"], vec![1.0, -1.0]);
    }

    #[test]
    fn test_load_rejects_shape_mismatch() {
        let mut model = LinearModel::new(TaskDescriptor::classification(["a", "b"]), 2);
        let mut state = model.state_dict();
        state.insert("weight".into(), vec![1.0]);
        assert!(model.load_state_dict(&state).is_err());
        state.remove("weight");
        assert!(model.load_state_dict(&state).is_err());
    }
}
