//! Epoch-level learning-rate schedules.

use serde::Deserialize;

use super::parse_params;
use vigil_core::{ConfigError, Params, Result};

/// Maps a 0-based epoch index to a learning rate.
pub trait LrScheduler: Send {
    fn name(&self) -> &str;

    fn learning_rate(&self, epoch: usize, base_lr: f64) -> f64;
}

fn default_gamma() -> f64 {
    0.1
}

fn check_gamma(gamma: f64) -> Result<()> {
    if !(gamma.is_finite() && gamma > 0.0) {
        return Err(ConfigError::invalid("gamma", "decay factor must be positive").into());
    }
    Ok(())
}

/// Multiply by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepLr {
    pub step_size: usize,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

impl StepLr {
    pub fn from_params(params: &Params) -> Result<Self> {
        let sched: Self = parse_params("step_lr", params)?;
        if sched.step_size == 0 {
            return Err(ConfigError::invalid("step_size", "must be at least 1").into());
        }
        check_gamma(sched.gamma)?;
        Ok(sched)
    }
}

impl LrScheduler for StepLr {
    fn name(&self) -> &str {
        "step_lr"
    }

    fn learning_rate(&self, epoch: usize, base_lr: f64) -> f64 {
        let decays = epoch / self.step_size;
        base_lr * self.gamma.powi(decays as i32)
    }
}

/// Multiply by `gamma` at each milestone epoch.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultiStep {
    pub milestones: Vec<usize>,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

impl MultiStep {
    pub fn from_params(params: &Params) -> Result<Self> {
        let mut sched: Self = parse_params("multi_step", params)?;
        check_gamma(sched.gamma)?;
        sched.milestones.sort_unstable();
        Ok(sched)
    }
}

impl LrScheduler for MultiStep {
    fn name(&self) -> &str {
        "multi_step"
    }

    fn learning_rate(&self, epoch: usize, base_lr: f64) -> f64 {
        let passed = self.milestones.iter().filter(|m| **m <= epoch).count();
        base_lr * self.gamma.powi(passed as i32)
    }
}

/// `lr = base_lr * gamma^epoch`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Exponential {
    pub gamma: f64,
}

impl Exponential {
    pub fn from_params(params: &Params) -> Result<Self> {
        let sched: Self = parse_params("exponential", params)?;
        check_gamma(sched.gamma)?;
        Ok(sched)
    }
}

impl LrScheduler for Exponential {
    fn name(&self) -> &str {
        "exponential"
    }

    fn learning_rate(&self, epoch: usize, base_lr: f64) -> f64 {
        base_lr * self.gamma.powi(epoch as i32)
    }
}

/// Cosine annealing from the base rate down to `eta_min` over `t_max` epochs,
/// then held at `eta_min`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Cosine {
    pub t_max: usize,
    #[serde(default)]
    pub eta_min: f64,
}

impl Cosine {
    pub fn from_params(params: &Params) -> Result<Self> {
        let sched: Self = parse_params("cosine", params)?;
        if sched.t_max == 0 {
            return Err(ConfigError::invalid("t_max", "must be at least 1").into());
        }
        Ok(sched)
    }
}

impl LrScheduler for Cosine {
    fn name(&self) -> &str {
        "cosine"
    }

    fn learning_rate(&self, epoch: usize, base_lr: f64) -> f64 {
        let progress = epoch.min(self.t_max) as f64 / self.t_max as f64;
        let cosine = (std::f64::consts::PI * progress).cos();
        self.eta_min + (base_lr - self.eta_min) * (1.0 + cosine) / 2.0
    }
}
