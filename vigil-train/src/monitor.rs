//! Best-epoch tracking for the monitored metric.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::components::{MetricGoal, MetricSet};
use crate::executor::Phase;
use crate::outputs::EpochOutputs;
use vigil_core::{ConfigError, Result};

/// Phase whose results drive best-model selection. Fixed per session: the
/// validation phase when a validation loader exists, training otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorSource {
    Train,
    Valid,
}

impl MonitorSource {
    pub fn for_session(has_valid_loader: bool) -> Self {
        if has_valid_loader { Self::Valid } else { Self::Train }
    }

    pub fn phase(self) -> Phase {
        match self {
            Self::Train => Phase::Train,
            Self::Valid => Phase::Valid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorState {
    AwaitingFirst,
    Tracking { best: f64 },
}

/// Tracks one scalar metric and reports when an epoch improves on the best.
#[derive(Debug, Clone)]
pub struct MetricMonitor {
    name: String,
    goal: MetricGoal,
    source: MonitorSource,
    state: MonitorState,
}

impl MetricMonitor {
    /// Monitor `name`, which must be a scalar metric with a goal in `metrics`.
    pub fn new(name: &str, metrics: &MetricSet, source: MonitorSource) -> Result<Self> {
        let metric = metrics
            .get(name)
            .ok_or_else(|| ConfigError::MonitorNotDeclared {
                name: name.to_string(),
            })?;
        let goal = metric.goal().ok_or_else(|| ConfigError::NoGoal {
            name: name.to_string(),
        })?;
        if !metric.is_scalar() {
            return Err(ConfigError::invalid("monitor", format!("metric '{name}' is not scalar")).into());
        }
        Ok(Self::with_goal(name, goal, source))
    }

    pub fn with_goal(name: &str, goal: MetricGoal, source: MonitorSource) -> Self {
        Self {
            name: name.to_string(),
            goal,
            source,
            state: MonitorState::AwaitingFirst,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn goal(&self) -> MetricGoal {
        self.goal
    }

    pub fn source(&self) -> MonitorSource {
        self.source
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn best(&self) -> Option<f64> {
        match self.state {
            MonitorState::AwaitingFirst => None,
            MonitorState::Tracking { best } => Some(best),
        }
    }

    /// Reinstate the best value stored in a checkpoint.
    pub fn restore(&mut self, best: Option<f64>) {
        self.state = match best {
            Some(best) => MonitorState::Tracking { best },
            None => MonitorState::AwaitingFirst,
        };
    }

    /// Feed one value; returns whether it is a new best. The first value is
    /// always a new best. NaN never is.
    pub fn observe(&mut self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        let improved = match self.state {
            MonitorState::AwaitingFirst => true,
            MonitorState::Tracking { best } => self.goal.is_improvement(value, best),
        };
        if improved {
            self.state = MonitorState::Tracking { best: value };
        }
        improved
    }

    /// Monitored value in `phase`'s result, failing if it is absent.
    pub fn value_in(&self, outputs: &EpochOutputs, phase: Phase) -> Result<f64> {
        let missing = || ConfigError::MonitorMissing {
            name: self.name.clone(),
            phase: phase.to_string(),
        };
        let value = outputs
            .phase(phase)
            .and_then(|r| r.metric(&self.name))
            .ok_or_else(missing)?;
        value.as_scalar().ok_or_else(|| {
            ConfigError::invalid("monitor", format!("metric '{}' is not scalar", self.name)).into()
        })
    }

    /// Check every phase result of the epoch for the monitored metric, then
    /// observe the authoritative one.
    pub fn observe_epoch(&mut self, outputs: &EpochOutputs) -> Result<bool> {
        for phase in [Phase::Train, Phase::Valid] {
            if outputs.phase(phase).is_some() {
                self.value_in(outputs, phase)?;
            }
        }
        let value = self.value_in(outputs, self.source.phase())?;
        let improved = self.observe(value);
        debug!(monitor = %self.name, value, improved, "monitor observation");
        Ok(improved)
    }
}
