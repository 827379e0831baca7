//! Gradient-based optimizers.

use serde::{Deserialize, Serialize};

use super::parse_params;
use crate::model::StateDict;
use vigil_core::{ConfigError, Params, Result, VigilError};

/// Updates model parameters from accumulated gradients.
pub trait Optimizer: Send {
    fn name(&self) -> &str;

    /// Current learning rate.
    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Learning rate the optimizer was configured with.
    fn base_learning_rate(&self) -> f64;

    fn step(&mut self, params: &mut StateDict, grads: &StateDict) -> Result<()>;

    /// Serializable internal state (moments, step counters, learning rate).
    fn state(&self) -> serde_json::Value;

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()>;
}

fn tensor_pair<'a>(
    params: &'a mut StateDict,
    name: &str,
    grad: &[f64],
) -> Result<&'a mut Vec<f64>> {
    let values = params
        .get_mut(name)
        .ok_or_else(|| VigilError::phase(format!("gradient for unknown parameter '{name}'")))?;
    if values.len() != grad.len() {
        return Err(VigilError::phase(format!(
            "gradient for '{name}' has {} values, parameter has {}",
            grad.len(),
            values.len()
        )));
    }
    Ok(values)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SgdParams {
    lr: f64,
    #[serde(default)]
    momentum: f64,
    #[serde(default)]
    nesterov: bool,
    #[serde(default)]
    weight_decay: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SgdState {
    lr: f64,
    velocity: StateDict,
}

/// Stochastic gradient descent with optional (Nesterov) momentum and L2
/// weight decay.
#[derive(Debug, Clone)]
pub struct Sgd {
    base_lr: f64,
    lr: f64,
    momentum: f64,
    nesterov: bool,
    weight_decay: f64,
    velocity: StateDict,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self {
            base_lr: lr,
            lr,
            momentum: 0.0,
            nesterov: false,
            weight_decay: 0.0,
            velocity: StateDict::new(),
        }
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        let parsed: SgdParams = parse_params("sgd", params)?;
        check_lr(parsed.lr)?;
        if parsed.momentum < 0.0 || parsed.weight_decay < 0.0 {
            return Err(ConfigError::invalid("sgd", "momentum and weight_decay must be non-negative").into());
        }
        if parsed.nesterov && parsed.momentum == 0.0 {
            return Err(ConfigError::invalid("nesterov", "nesterov momentum requires momentum > 0").into());
        }
        Ok(Self {
            momentum: parsed.momentum,
            nesterov: parsed.nesterov,
            weight_decay: parsed.weight_decay,
            ..Self::new(parsed.lr)
        })
    }
}

fn check_lr(lr: f64) -> Result<()> {
    if !(lr.is_finite() && lr > 0.0) {
        return Err(ConfigError::invalid("lr", "learning rate must be a positive number").into());
    }
    Ok(())
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "sgd"
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn base_learning_rate(&self) -> f64 {
        self.base_lr
    }

    fn step(&mut self, params: &mut StateDict, grads: &StateDict) -> Result<()> {
        for (name, grad) in grads {
            let values = tensor_pair(params, name, grad)?;
            let velocity = self
                .velocity
                .entry(name.clone())
                .or_insert_with(|| vec![0.0; grad.len()]);
            for ((p, g), v) in values.iter_mut().zip(grad).zip(velocity.iter_mut()) {
                let mut d = g + self.weight_decay * *p;
                if self.momentum != 0.0 {
                    *v = self.momentum * *v + d;
                    d = if self.nesterov { d + self.momentum * *v } else { *v };
                }
                *p -= self.lr * d;
            }
        }
        Ok(())
    }

    fn state(&self) -> serde_json::Value {
        serde_json::to_value(SgdState {
            lr: self.lr,
            velocity: self.velocity.clone(),
        })
        .unwrap_or_default()
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        let state: SgdState = serde_json::from_value(state.clone())?;
        self.lr = state.lr;
        self.velocity = state.velocity;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdamParams {
    #[serde(default = "default_adam_lr")]
    lr: f64,
    #[serde(default = "default_betas")]
    betas: (f64, f64),
    #[serde(default = "default_eps")]
    eps: f64,
    #[serde(default)]
    weight_decay: f64,
}

fn default_adam_lr() -> f64 {
    1e-3
}

fn default_betas() -> (f64, f64) {
    (0.9, 0.999)
}

fn default_eps() -> f64 {
    1e-8
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AdamState {
    lr: f64,
    step: u64,
    m: StateDict,
    v: StateDict,
}

/// Adam with bias-corrected first and second moment estimates.
#[derive(Debug, Clone)]
pub struct Adam {
    base_lr: f64,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    step: u64,
    m: StateDict,
    v: StateDict,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        let (beta1, beta2) = default_betas();
        Self {
            base_lr: lr,
            lr,
            beta1,
            beta2,
            eps: default_eps(),
            weight_decay: 0.0,
            step: 0,
            m: StateDict::new(),
            v: StateDict::new(),
        }
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        let parsed: AdamParams = parse_params("adam", params)?;
        check_lr(parsed.lr)?;
        let (beta1, beta2) = parsed.betas;
        if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) {
            return Err(ConfigError::invalid("betas", "both betas must lie in [0, 1)").into());
        }
        Ok(Self {
            beta1,
            beta2,
            eps: parsed.eps,
            weight_decay: parsed.weight_decay,
            ..Self::new(parsed.lr)
        })
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "adam"
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn base_learning_rate(&self) -> f64 {
        self.base_lr
    }

    fn step(&mut self, params: &mut StateDict, grads: &StateDict) -> Result<()> {
        self.step += 1;
        let bc1 = 1.0 - self.beta1.powi(self.step as i32);
        let bc2 = 1.0 - self.beta2.powi(self.step as i32);
        for (name, grad) in grads {
            let values = tensor_pair(params, name, grad)?;
            let m = self.m.entry(name.clone()).or_insert_with(|| vec![0.0; grad.len()]);
            let v = self.v.entry(name.clone()).or_insert_with(|| vec![0.0; grad.len()]);
            for (((p, g), m), v) in values.iter_mut().zip(grad).zip(m.iter_mut()).zip(v.iter_mut()) {
                let g = g + self.weight_decay * *p;
                *m = self.beta1 * *m + (1.0 - self.beta1) * g;
                *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
                let m_hat = *m / bc1;
                let v_hat = *v / bc2;
                *p -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
        Ok(())
    }

    fn state(&self) -> serde_json::Value {
        serde_json::to_value(AdamState {
            lr: self.lr,
            step: self.step,
            m: self.m.clone(),
            v: self.v.clone(),
        })
        .unwrap_or_default()
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        let state: AdamState = serde_json::from_value(state.clone())?;
        self.lr = state.lr;
        self.step = state.step;
        self.m = state.m;
        self.v = state.v;
        Ok(())
    }
}
