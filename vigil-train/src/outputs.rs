//! Per-epoch phase results and the session's output history.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::components::MetricValue;
use crate::executor::Phase;
use vigil_core::{Result, VigilError};

/// Loss and metric values produced by one phase pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricValue>,
}

impl PhaseResult {
    pub fn new(loss: Option<f64>, metrics: BTreeMap<String, MetricValue>) -> Self {
        Self { loss, metrics }
    }

    pub fn metric(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }
}

/// Results of every phase that ran for one epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train: Option<PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<PhaseResult>,
}

impl EpochOutputs {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseResult> {
        match phase {
            Phase::Train => self.train.as_ref(),
            Phase::Valid => self.valid.as_ref(),
            Phase::Test => self.test.as_ref(),
        }
    }

    pub fn set(&mut self, phase: Phase, result: PhaseResult) {
        let slot = match phase {
            Phase::Train => &mut self.train,
            Phase::Valid => &mut self.valid,
            Phase::Test => &mut self.test,
        };
        *slot = Some(result);
    }

    pub fn with(mut self, phase: Phase, result: PhaseResult) -> Self {
        self.set(phase, result);
        self
    }

    /// Copy in every phase present in `other`, keeping the others.
    pub fn extend(&mut self, other: EpochOutputs) {
        for phase in Phase::ALL {
            if let Some(result) = other.phase(phase) {
                self.set(phase, result.clone());
            }
        }
    }

    /// `(phase/key, value)` pairs for logging.
    pub fn flatten(&self) -> Vec<(String, String)> {
        let mut lines = Vec::new();
        for phase in Phase::ALL {
            let Some(result) = self.phase(phase) else {
                continue;
            };
            if let Some(loss) = result.loss {
                lines.push((format!("{phase}/loss"), format!("{loss:.6}")));
            }
            for (name, value) in &result.metrics {
                lines.push((format!("{phase}/metrics:{name}"), value.to_string()));
            }
        }
        lines
    }
}

/// Ordered mapping from epoch number to that epoch's outputs.
///
/// Epochs are appended in increasing order. The only way to change an entry
/// after it is appended is [`OutputHistory::merge_into_epoch`], used to attach
/// results computed later for the same epoch (the post-training test run and
/// evaluation-only passes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputHistory {
    epochs: BTreeMap<usize, EpochOutputs>,
}

impl OutputHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit a completed epoch. `epoch` must be newer than every stored one.
    pub fn append(&mut self, epoch: usize, outputs: EpochOutputs) -> Result<()> {
        if let Some(last) = self.last_epoch() {
            if epoch <= last {
                return Err(VigilError::invalid_state(format!(
                    "cannot append outputs for epoch {epoch}, history already reaches epoch {last}"
                )));
            }
        }
        self.epochs.insert(epoch, outputs);
        Ok(())
    }

    /// Extend the outputs stored for `epoch` with the phases in `update`,
    /// creating the entry if it does not exist yet.
    pub fn merge_into_epoch(&mut self, epoch: usize, update: EpochOutputs) -> &EpochOutputs {
        let entry = self.epochs.entry(epoch).or_default();
        entry.extend(update);
        entry
    }

    pub fn get(&self, epoch: usize) -> Option<&EpochOutputs> {
        self.epochs.get(&epoch)
    }

    pub fn last_epoch(&self) -> Option<usize> {
        self.epochs.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &EpochOutputs)> {
        self.epochs.iter().map(|(k, v)| (*k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn result(loss: f64, metric: f64) -> PhaseResult {
        PhaseResult::new(
            Some(loss),
            BTreeMap::from([("loss".to_string(), MetricValue::Scalar(metric))]),
        )
    }

    #[test]
    fn test_append_is_ordered() {
        let mut history = OutputHistory::new();
        history.append(1, EpochOutputs::default()).unwrap();
        history.append(3, EpochOutputs::default()).unwrap();
        assert!(history.append(3, EpochOutputs::default()).is_err());
        assert!(history.append(2, EpochOutputs::default()).is_err());
        assert_eq!(history.last_epoch(), Some(3));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_merge_extends_existing_epoch() {
        let mut history = OutputHistory::new();
        let train = result(0.5, 0.5);
        history
            .append(2, EpochOutputs::default().with(Phase::Train, train.clone()))
            .unwrap();

        let merged = history
            .merge_into_epoch(2, EpochOutputs::default().with(Phase::Test, result(0.0, 0.9)))
            .clone();
        assert_eq!(merged.train, Some(train));
        assert!(merged.test.is_some());

        history.merge_into_epoch(0, EpochOutputs::default().with(Phase::Valid, result(1.0, 1.0)));
        assert!(history.get(0).unwrap().valid.is_some());
    }

    #[test]
    fn test_history_json_shape() {
        let mut history = OutputHistory::new();
        history
            .append(1, EpochOutputs::default().with(Phase::Train, result(0.25, 0.5)))
            .unwrap();
        let json = serde_json::to_value(&history).unwrap();
        assert_eq!(json["1"]["train"]["loss"], 0.25);
        assert_eq!(json["1"]["train"]["metrics"]["loss"], 0.5);
        let back: OutputHistory = serde_json::from_value(json).unwrap();
        assert_eq!(back, history);
    }

    #[test]
    fn test_flatten_for_logging() {
        let outputs = EpochOutputs::default().with(Phase::Valid, result(0.1, 0.2));
        let lines = outputs.flatten();
        assert_eq!(lines[0].0, "valid/loss");
        assert_eq!(lines[1].0, "valid/metrics:loss");
    }
}
