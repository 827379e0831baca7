//! Phase executor boundary.
//!
//! A [`PhaseExecutor`] runs one full pass over a loader for a given phase. The
//! trainer owns sequencing, monitoring and persistence; the executor owns the
//! per-batch work (forward, loss, backward, optimizer step, metric updates).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::components::{Loss, MetricSet, Optimizer};
use crate::data::Loader;
use crate::device::Placement;
use crate::model::Model;
use crate::telemetry::SummaryWriter;
use vigil_core::Result;

/// One of the three passes a session can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Train,
    Valid,
    Test,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Train, Phase::Valid, Phase::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Valid => "valid",
            Self::Test => "test",
        }
    }

    /// Configuration field holding this phase's device specification.
    pub fn device_field(self) -> &'static str {
        match self {
            Self::Train => "train_device",
            Self::Valid => "valid_device",
            Self::Test => "test_device",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a training pass needs.
pub struct TrainPass<'a, M, L> {
    pub model: &'a mut M,
    pub epoch: usize,
    /// Iteration counter at the start of the pass.
    pub iter: u64,
    pub placement: &'a Placement,
    pub loader: &'a L,
    pub metrics: &'a mut MetricSet,
    pub loss: &'a dyn Loss,
    pub optimizer: &'a mut dyn Optimizer,
    pub writer: Option<&'a mut dyn SummaryWriter>,
    /// Name of the monitored metric, for progress reporting.
    pub monitor: &'a str,
}

/// Everything a validation or test pass needs.
pub struct EvalPass<'a, M, L> {
    pub phase: Phase,
    pub model: &'a M,
    pub epoch: usize,
    pub iter: u64,
    pub placement: &'a Placement,
    pub loader: &'a L,
    pub metrics: &'a mut MetricSet,
    pub loss: &'a dyn Loss,
    pub writer: Option<&'a mut dyn SummaryWriter>,
    pub monitor: &'a str,
}

/// Result of a training pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainOutcome {
    /// Mean loss over the pass.
    pub loss: f64,
    /// Iteration counter after the pass.
    pub iter: u64,
}

/// Task-specific pass implementation.
pub trait PhaseExecutor<M: Model, L: Loader> {
    fn train_epoch(&mut self, pass: TrainPass<'_, M, L>) -> Result<TrainOutcome>;

    /// Run an evaluation pass. Metric values are read back from
    /// `pass.metrics`; the returned value is the mean loss, if computed.
    fn eval_epoch(&mut self, pass: EvalPass<'_, M, L>) -> Result<Option<f64>>;
}
