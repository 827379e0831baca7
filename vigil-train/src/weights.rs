//! Per-class loss weights derived from label frequencies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use vigil_core::{ConfigError, LossConfig, Result};

/// How class frequencies are flattened before inversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distribution {
    /// Weight inversely proportional to class frequency.
    Uniform,
    /// Frequency raised to `1/K` before inversion (`rootK`).
    Root(u32),
}

impl Distribution {
    fn exponent(self) -> f64 {
        match self {
            Self::Uniform => 1.0,
            Self::Root(k) => 1.0 / f64::from(k),
        }
    }
}

impl FromStr for Distribution {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s == "uniform" {
            return Ok(Self::Uniform);
        }
        let invalid = || {
            ConfigError::invalid(
                "weight_distribution",
                format!("unexpected weight distribution strategy '{s}'"),
            )
        };
        let root = s.strip_prefix("root").ok_or_else(invalid)?;
        match root.parse::<u32>() {
            Ok(k) if k > 0 => Ok(Self::Root(k)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform => write!(f, "uniform"),
            Self::Root(k) => write!(f, "root{k}"),
        }
    }
}

/// Weighting policy: distribution, upper clip, mean normalization.
///
/// Clipping happens before normalization, so `max_weight` is a strict upper
/// bound on the output only when `normalize` is off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightPolicy {
    pub distribution: Distribution,
    pub max_weight: f64,
    pub normalize: bool,
}

impl Default for WeightPolicy {
    fn default() -> Self {
        Self {
            distribution: Distribution::Uniform,
            max_weight: f64::INFINITY,
            normalize: true,
        }
    }
}

impl WeightPolicy {
    /// Policy described by the class-weighting fields of a loss section.
    pub fn from_loss_config(config: &LossConfig) -> Result<Self> {
        let max_weight = config.weight_max.unwrap_or(f64::INFINITY);
        if max_weight.is_nan() || max_weight <= 0.0 {
            return Err(ConfigError::invalid("weight_max", "maximum weight must be positive").into());
        }
        Ok(Self {
            distribution: config.weight_distribution.parse()?,
            max_weight,
            normalize: config.weight_norm,
        })
    }
}

/// Resolved weights in class order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassWeights {
    entries: Vec<(String, f64)>,
}

impl ClassWeights {
    /// Dense vector in class-index order.
    pub fn dense(&self) -> Vec<f64> {
        self.entries.iter().map(|(_, w)| *w).collect()
    }

    /// Name to weight mapping.
    pub fn named(&self) -> BTreeMap<String, f64> {
        self.entries.iter().cloned().collect()
    }

    pub fn get(&self, class_name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(name, _)| name == class_name)
            .map(|(_, w)| *w)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(name, w)| (name.as_str(), *w))
    }

    /// JSON form injected into loss parameters.
    pub fn to_param(&self, pass_tensor: bool) -> serde_json::Value {
        if pass_tensor {
            serde_json::json!(self.dense())
        } else {
            serde_json::json!(self.named())
        }
    }
}

/// Computes class weights from per-class sample counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassWeightResolver {
    policy: WeightPolicy,
}

impl ClassWeightResolver {
    pub fn new(policy: WeightPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &WeightPolicy {
        &self.policy
    }

    /// Resolve weights for `class_names` (class-index order) from `counts`.
    ///
    /// An empty `class_names` uses the count keys in sorted order. Classes
    /// without samples receive `max_weight`, which must then be finite.
    pub fn resolve(
        &self,
        counts: &BTreeMap<String, u64>,
        class_names: &[String],
    ) -> Result<ClassWeights> {
        let order: Vec<String> = if class_names.is_empty() {
            counts.keys().cloned().collect()
        } else {
            if let Some(unknown) = counts.keys().find(|k| !class_names.contains(k)) {
                return Err(ConfigError::invalid(
                    "weight_classes",
                    format!("label '{unknown}' is not a class of the task"),
                )
                .into());
            }
            class_names.to_vec()
        };
        if order.is_empty() {
            return Err(ConfigError::invalid("weight_classes", "no classes to weight").into());
        }

        let total: u64 = counts.values().sum();
        if total == 0 {
            return Err(ConfigError::invalid(
                "weight_classes",
                "total sample count must be positive",
            )
            .into());
        }

        let exponent = self.policy.distribution.exponent();
        let freqs: Vec<f64> = order
            .iter()
            .map(|name| {
                let size = counts.get(name).copied().unwrap_or(0) as f64;
                (size / total as f64).powf(exponent)
            })
            .collect();
        let max_freq = freqs.iter().copied().fold(0.0_f64, f64::max);

        let mut weights = Vec::with_capacity(freqs.len());
        for (name, freq) in order.iter().zip(&freqs) {
            let weight = if *freq > 0.0 {
                (max_freq / freq).min(self.policy.max_weight)
            } else if self.policy.max_weight.is_finite() {
                self.policy.max_weight
            } else {
                return Err(ConfigError::invalid(
                    "weight_classes",
                    format!("class '{name}' has no samples and no 'weight_max' is set"),
                )
                .into());
            };
            weights.push(weight);
        }

        if self.policy.normalize {
            let mean = weights.iter().sum::<f64>() / weights.len() as f64;
            for w in &mut weights {
                *w /= mean;
            }
        }

        Ok(ClassWeights {
            entries: order.into_iter().zip(weights).collect(),
        })
    }
}
