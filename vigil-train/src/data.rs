//! Dataset loader boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An ordered, finite and restartable source of batches.
pub trait Loader {
    type Batch;

    /// Number of batches in one pass.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate one full pass, in order. Each call restarts from the first batch.
    fn batches(&self) -> Box<dyn Iterator<Item = Self::Batch> + '_>;

    /// Per-class sample counts of the underlying dataset, when known.
    fn class_counts(&self) -> Option<BTreeMap<String, u64>> {
        None
    }
}

/// Inputs with their string class labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledBatch {
    pub inputs: Vec<Vec<f64>>,
    pub labels: Vec<String>,
}

impl LabeledBatch {
    pub fn new(inputs: Vec<Vec<f64>>, labels: Vec<String>) -> Self {
        Self { inputs, labels }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Ground truth handed to losses and metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Target {
    Class(usize),
    Values(Vec<f64>),
}

impl Target {
    pub fn class(&self) -> Option<usize> {
        match self {
            Self::Class(idx) => Some(*idx),
            Self::Values(_) => None,
        }
    }

    /// Regression view: class targets become a one-element vector.
    pub fn values(&self) -> Vec<f64> {
        match self {
            Self::Class(idx) => vec![*idx as f64],
            Self::Values(values) => values.clone(),
        }
    }
}

/// Loader over batches held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryLoader<B> {
    batches: Vec<B>,
    class_counts: Option<BTreeMap<String, u64>>,
}

impl<B: Clone> InMemoryLoader<B> {
    pub fn new(batches: Vec<B>) -> Self {
        Self {
            batches,
            class_counts: None,
        }
    }

    pub fn with_class_counts(mut self, counts: BTreeMap<String, u64>) -> Self {
        self.class_counts = Some(counts);
        self
    }
}

impl InMemoryLoader<LabeledBatch> {
    /// Loader whose class statistics are counted from the batch labels.
    pub fn labeled(batches: Vec<LabeledBatch>) -> Self {
        let mut counts = BTreeMap::new();
        for label in batches.iter().flat_map(|b| &b.labels) {
            *counts.entry(label.clone()).or_insert(0) += 1;
        }
        Self::new(batches).with_class_counts(counts)
    }
}

impl<B: Clone> Loader for InMemoryLoader<B> {
    type Batch = B;

    fn len(&self) -> usize {
        self.batches.len()
    }

    fn batches(&self) -> Box<dyn Iterator<Item = B> + '_> {
        Box::new(self.batches.iter().cloned())
    }

    fn class_counts(&self) -> Option<BTreeMap<String, u64>> {
        self.class_counts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(labels: &[&str]) -> LabeledBatch {
        LabeledBatch::new(
            labels.iter().map(|_| vec![0.0]).collect(),
            labels.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_labeled_loader_counts_classes() {
        let loader = InMemoryLoader::labeled(vec![batch(&["a", "b"]), batch(&["a"])]);
        assert_eq!(loader.len(), 2);
        let counts = loader.class_counts().unwrap();
        assert_eq!(counts["a"], 2);
        assert_eq!(counts["b"], 1);
    }

    #[test]
    fn test_batches_restart() {
        let loader = InMemoryLoader::new(vec![1, 2, 3]);
        let first: Vec<i32> = loader.batches().collect();
        let second: Vec<i32> = loader.batches().collect();
        assert_eq!(first, second);
        assert!(loader.class_counts().is_none());
        assert!(InMemoryLoader::<i32>::new(vec![]).is_empty());
    }

    #[test]
    fn test_target_views() {
        assert_eq!(Target::Class(2).class(), Some(2));
        assert_eq!(Target::Values(vec![1.5]).class(), None);
        assert_eq!(Target::Class(2).values(), vec![2.0]);
    }
}
