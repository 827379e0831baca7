//! Loss functions.

use serde::Deserialize;

use super::parse_params;
use crate::data::Target;
use vigil_core::{Params, Result, VigilError};

/// A scalar objective over one model output and its target.
pub trait Loss: Send {
    fn name(&self) -> &str;

    fn compute(&self, output: &[f64], target: &Target) -> Result<f64>;

    /// Gradient of [`Loss::compute`] with respect to `output`.
    fn gradient(&self, output: &[f64], target: &Target) -> Result<Vec<f64>>;

    /// Optional human-readable description logged when the loss is built.
    fn summary(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CrossEntropyParams {
    #[serde(default)]
    weight: Option<Vec<f64>>,
}

/// Softmax negative log-likelihood with optional per-class weights.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropy {
    weight: Option<Vec<f64>>,
}

impl CrossEntropy {
    pub fn new(weight: Option<Vec<f64>>) -> Self {
        Self { weight }
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        let parsed: CrossEntropyParams = parse_params("cross_entropy", params)?;
        Ok(Self::new(parsed.weight))
    }

    pub fn weight(&self) -> Option<&[f64]> {
        self.weight.as_deref()
    }

    fn class_of(&self, output: &[f64], target: &Target) -> Result<usize> {
        let class = target
            .class()
            .ok_or_else(|| VigilError::phase("cross_entropy expects class targets"))?;
        if class >= output.len() {
            return Err(VigilError::phase(format!(
                "class index {class} out of range for {} outputs",
                output.len()
            )));
        }
        Ok(class)
    }

    fn class_weight(&self, class: usize) -> f64 {
        self.weight
            .as_ref()
            .and_then(|w| w.get(class).copied())
            .unwrap_or(1.0)
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|x| (x - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

impl Loss for CrossEntropy {
    fn name(&self) -> &str {
        "cross_entropy"
    }

    fn compute(&self, output: &[f64], target: &Target) -> Result<f64> {
        let class = self.class_of(output, target)?;
        let probs = softmax(output);
        Ok(-self.class_weight(class) * probs[class].max(f64::MIN_POSITIVE).ln())
    }

    fn gradient(&self, output: &[f64], target: &Target) -> Result<Vec<f64>> {
        let class = self.class_of(output, target)?;
        let scale = self.class_weight(class);
        let mut grad = softmax(output);
        grad[class] -= 1.0;
        grad.iter_mut().for_each(|g| *g *= scale);
        Ok(grad)
    }

    fn summary(&self) -> Option<String> {
        self.weight
            .as_ref()
            .map(|w| format!("cross_entropy with class weights {w:?}"))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MseParams {}

/// Mean squared error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mse;

impl Mse {
    pub fn from_params(params: &Params) -> Result<Self> {
        let _: MseParams = parse_params("mse", params)?;
        Ok(Self)
    }
}

fn check_len(output: &[f64], expected: &[f64]) -> Result<()> {
    if output.len() != expected.len() {
        return Err(VigilError::phase(format!(
            "mse output has {} values, target has {}",
            output.len(),
            expected.len()
        )));
    }
    Ok(())
}

impl Loss for Mse {
    fn name(&self) -> &str {
        "mse"
    }

    fn compute(&self, output: &[f64], target: &Target) -> Result<f64> {
        let expected = target.values();
        check_len(output, &expected)?;
        if output.is_empty() {
            return Ok(0.0);
        }
        let sum: f64 = output.iter().zip(&expected).map(|(o, t)| (o - t).powi(2)).sum();
        Ok(sum / output.len() as f64)
    }

    fn gradient(&self, output: &[f64], target: &Target) -> Result<Vec<f64>> {
        let expected = target.values();
        check_len(output, &expected)?;
        let scale = 2.0 / output.len().max(1) as f64;
        Ok(output.iter().zip(&expected).map(|(o, t)| (o - t) * scale).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> Params {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let loss = CrossEntropy::default();
        let value = loss.compute(&[0.0, 0.0], &Target::Class(1)).unwrap();
        assert!((value - 2f64.ln()).abs() < 1e-12);

        let grad = loss.gradient(&[0.0, 0.0], &Target::Class(1)).unwrap();
        assert!((grad[0] - 0.5).abs() < 1e-12);
        assert!((grad[1] + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_cross_entropy_class_weight() {
        let loss = CrossEntropy::from_params(&params(json!({"weight": [1.0, 3.0]}))).unwrap();
        let plain = CrossEntropy::default().compute(&[0.2, 0.1], &Target::Class(1)).unwrap();
        let weighted = loss.compute(&[0.2, 0.1], &Target::Class(1)).unwrap();
        assert!((weighted - 3.0 * plain).abs() < 1e-12);
        assert!(loss.summary().is_some());
    }

    #[test]
    fn test_cross_entropy_rejects_named_weights() {
        let err = CrossEntropy::from_params(&params(json!({"weight": {"a": 1.0}}))).unwrap_err();
        assert!(err.is_config());
        let err = CrossEntropy::from_params(&params(json!({"reduction": "sum"}))).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_cross_entropy_bad_target() {
        let loss = CrossEntropy::default();
        assert!(loss.compute(&[0.0], &Target::Class(3)).is_err());
        assert!(loss.compute(&[0.0], &Target::Values(vec![1.0])).is_err());
    }

    #[test]
    fn test_mse() {
        let loss = Mse::from_params(&Params::new()).unwrap();
        let target = Target::Values(vec![1.0, 3.0]);
        assert_eq!(loss.compute(&[2.0, 1.0], &target).unwrap(), 2.5);
        assert_eq!(loss.gradient(&[2.0, 1.0], &target).unwrap(), vec![1.0, -2.0]);
        assert!(loss.compute(&[1.0], &target).is_err());
    }
}
