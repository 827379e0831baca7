//! Stateful evaluation metrics and their optional capabilities.
//!
//! A metric accumulates predictions batch by batch and evaluates to a
//! [`MetricValue`]. Optional behaviour is exposed through capability traits
//! ([`Summarizable`], [`AccumulationWindowed`], [`Visualizable`],
//! [`ClassAware`]) reached through the `as_*` accessors, so callers check for a
//! capability by type rather than by probing.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use super::parse_params;
use crate::data::Target;
use vigil_core::{ConfigError, Params, Result, VigilError};

/// Direction in which a metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricGoal {
    Minimize,
    Maximize,
}

impl MetricGoal {
    /// Strict improvement test; ties are not improvements.
    pub fn is_improvement(self, candidate: f64, best: f64) -> bool {
        match self {
            Self::Minimize => candidate < best,
            Self::Maximize => candidate > best,
        }
    }
}

impl fmt::Display for MetricGoal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minimize => write!(f, "minimize"),
            Self::Maximize => write!(f, "maximize"),
        }
    }
}

/// Evaluated metric output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Vector(Vec<f64>),
    Text(String),
}

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => write!(f, "{v:.6}"),
            Self::Vector(v) => write!(f, "{v:?}"),
            Self::Text(t) => write!(f, "{t}"),
        }
    }
}

/// 8-bit RGB raster produced by visualizable metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    pub width: usize,
    pub height: usize,
    /// Row-major RGB triples.
    pub pixels: Vec<u8>,
}

impl RgbImage {
    /// Binary PPM (`P6`) encoding.
    pub fn to_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.extend_from_slice(&self.pixels);
        out
    }
}

/// A metric accumulated over one phase.
pub trait Metric: Send {
    /// Registered type name.
    fn name(&self) -> &str;

    fn accumulate(&mut self, outputs: &[Vec<f64>], targets: &[Target]) -> Result<()>;

    fn eval(&self) -> MetricValue;

    /// Direction of improvement, or `None` for metrics that cannot be
    /// monitored. Fixed for the lifetime of the instance.
    fn goal(&self) -> Option<MetricGoal>;

    fn reset(&mut self);

    /// Whether training accumulation restarts at each epoch.
    fn needs_reset(&self) -> bool {
        true
    }

    fn is_scalar(&self) -> bool {
        true
    }

    /// Independent instance with the same configuration and no accumulated state.
    fn clone_fresh(&self) -> Box<dyn Metric>;

    fn as_summarizable(&self) -> Option<&dyn Summarizable> {
        None
    }

    fn as_windowed(&mut self) -> Option<&mut dyn AccumulationWindowed> {
        None
    }

    fn as_visualizable(&self) -> Option<&dyn Visualizable> {
        None
    }

    fn as_class_aware(&mut self) -> Option<&mut dyn ClassAware> {
        None
    }
}

pub trait Summarizable {
    fn summary(&self) -> String;
}

/// Metrics that average over a sliding window of batches.
pub trait AccumulationWindowed {
    fn set_max_accum(&mut self, max_batches: usize);
}

pub trait Visualizable {
    fn render_text(&self) -> Option<String> {
        None
    }

    fn render_image(&self) -> Option<RgbImage> {
        None
    }
}

/// Metrics that label their output with class names.
pub trait ClassAware {
    fn set_class_names(&mut self, class_names: &[String]);
}

fn check_batch(name: &str, outputs: &[Vec<f64>], targets: &[Target]) -> Result<()> {
    if outputs.len() != targets.len() {
        return Err(VigilError::phase(format!(
            "{name}: {} outputs for {} targets",
            outputs.len(),
            targets.len()
        )));
    }
    Ok(())
}

fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, _)| idx)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AccuracyParams {
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    max_accum: Option<usize>,
}

fn default_top_k() -> usize {
    1
}

/// Top-k classification accuracy, optionally a moving average over the last
/// `max_accum` batches.
#[derive(Debug, Clone)]
pub struct Accuracy {
    top_k: usize,
    max_accum: Option<usize>,
    // (correct, total) per accumulated batch
    window: VecDeque<(u64, u64)>,
}

impl Accuracy {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k: top_k.max(1),
            max_accum: None,
            window: VecDeque::new(),
        }
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        let parsed: AccuracyParams = parse_params("accuracy", params)?;
        if parsed.top_k == 0 {
            return Err(ConfigError::invalid("top_k", "must be at least 1").into());
        }
        let mut metric = Self::new(parsed.top_k);
        metric.max_accum = parsed.max_accum.filter(|m| *m > 0);
        Ok(metric)
    }

    fn trim(&mut self) {
        if let Some(max) = self.max_accum {
            while self.window.len() > max {
                self.window.pop_front();
            }
        }
    }
}

impl Metric for Accuracy {
    fn name(&self) -> &str {
        "accuracy"
    }

    fn accumulate(&mut self, outputs: &[Vec<f64>], targets: &[Target]) -> Result<()> {
        check_batch("accuracy", outputs, targets)?;
        let mut correct = 0;
        for (output, target) in outputs.iter().zip(targets) {
            let class = target
                .class()
                .ok_or_else(|| VigilError::phase("accuracy expects class targets"))?;
            let score = output.get(class).copied().unwrap_or(f64::NEG_INFINITY);
            let higher = output.iter().filter(|v| **v > score).count();
            if class < output.len() && higher < self.top_k {
                correct += 1;
            }
        }
        self.window.push_back((correct, outputs.len() as u64));
        self.trim();
        Ok(())
    }

    fn eval(&self) -> MetricValue {
        let (correct, total) = self
            .window
            .iter()
            .fold((0u64, 0u64), |(c, t), &(bc, bt)| (c + bc, t + bt));
        if total == 0 {
            return MetricValue::Scalar(0.0);
        }
        MetricValue::Scalar(correct as f64 / total as f64)
    }

    fn goal(&self) -> Option<MetricGoal> {
        Some(MetricGoal::Maximize)
    }

    fn reset(&mut self) {
        self.window.clear();
    }

    fn needs_reset(&self) -> bool {
        self.max_accum.is_none()
    }

    fn clone_fresh(&self) -> Box<dyn Metric> {
        Box::new(Self {
            top_k: self.top_k,
            max_accum: self.max_accum,
            window: VecDeque::new(),
        })
    }

    fn as_summarizable(&self) -> Option<&dyn Summarizable> {
        Some(self)
    }

    fn as_windowed(&mut self) -> Option<&mut dyn AccumulationWindowed> {
        Some(self)
    }
}

impl Summarizable for Accuracy {
    fn summary(&self) -> String {
        match self.max_accum {
            Some(max) => format!("top-{} accuracy over the last {max} batches", self.top_k),
            None => format!("top-{} accuracy", self.top_k),
        }
    }
}

impl AccumulationWindowed for Accuracy {
    fn set_max_accum(&mut self, max_batches: usize) {
        self.max_accum = Some(max_batches.max(1));
        self.trim();
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptyParams {}

/// Mean absolute error over every output value.
#[derive(Debug, Clone, Default)]
pub struct Mae {
    sum: f64,
    count: u64,
}

impl Mae {
    pub fn from_params(params: &Params) -> Result<Self> {
        let _: EmptyParams = parse_params("mae", params)?;
        Ok(Self::default())
    }
}

impl Metric for Mae {
    fn name(&self) -> &str {
        "mae"
    }

    fn accumulate(&mut self, outputs: &[Vec<f64>], targets: &[Target]) -> Result<()> {
        check_batch("mae", outputs, targets)?;
        for (output, target) in outputs.iter().zip(targets) {
            let expected = target.values();
            if expected.len() != output.len() {
                return Err(VigilError::phase(format!(
                    "mae: output has {} values, target has {}",
                    output.len(),
                    expected.len()
                )));
            }
            self.sum += output.iter().zip(&expected).map(|(o, t)| (o - t).abs()).sum::<f64>();
            self.count += output.len() as u64;
        }
        Ok(())
    }

    fn eval(&self) -> MetricValue {
        if self.count == 0 {
            return MetricValue::Scalar(0.0);
        }
        MetricValue::Scalar(self.sum / self.count as f64)
    }

    fn goal(&self) -> Option<MetricGoal> {
        Some(MetricGoal::Minimize)
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }

    fn clone_fresh(&self) -> Box<dyn Metric> {
        Box::new(Self::default())
    }
}

/// Counts of (true class, predicted class) pairs.
#[derive(Debug, Clone, Default)]
pub struct ConfusionMatrix {
    class_names: Vec<String>,
    // rows: true class, columns: predicted class
    counts: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    pub fn from_params(params: &Params) -> Result<Self> {
        let _: EmptyParams = parse_params("confusion_matrix", params)?;
        Ok(Self::default())
    }

    pub fn counts(&self) -> &[Vec<u64>] {
        &self.counts
    }

    fn ensure_size(&mut self, size: usize) {
        if self.counts.len() < size {
            for row in &mut self.counts {
                row.resize(size, 0);
            }
            self.counts.resize_with(size, || vec![0; size]);
        }
    }

    fn label(&self, idx: usize) -> String {
        self.class_names
            .get(idx)
            .cloned()
            .unwrap_or_else(|| idx.to_string())
    }
}

impl Metric for ConfusionMatrix {
    fn name(&self) -> &str {
        "confusion_matrix"
    }

    fn accumulate(&mut self, outputs: &[Vec<f64>], targets: &[Target]) -> Result<()> {
        check_batch("confusion_matrix", outputs, targets)?;
        for (output, target) in outputs.iter().zip(targets) {
            let truth = target
                .class()
                .ok_or_else(|| VigilError::phase("confusion_matrix expects class targets"))?;
            let Some(pred) = argmax(output) else {
                continue;
            };
            self.ensure_size(self.class_names.len().max(output.len()).max(truth + 1));
            self.counts[truth][pred] += 1;
        }
        Ok(())
    }

    fn eval(&self) -> MetricValue {
        MetricValue::Text(self.render_table())
    }

    fn goal(&self) -> Option<MetricGoal> {
        None
    }

    fn reset(&mut self) {
        for row in &mut self.counts {
            row.iter_mut().for_each(|c| *c = 0);
        }
    }

    fn is_scalar(&self) -> bool {
        false
    }

    fn clone_fresh(&self) -> Box<dyn Metric> {
        Box::new(Self {
            class_names: self.class_names.clone(),
            counts: Vec::new(),
        })
    }

    fn as_visualizable(&self) -> Option<&dyn Visualizable> {
        Some(self)
    }

    fn as_class_aware(&mut self) -> Option<&mut dyn ClassAware> {
        Some(self)
    }
}

impl ConfusionMatrix {
    fn render_table(&self) -> String {
        let size = self.counts.len();
        let labels: Vec<String> = (0..size).map(|i| self.label(i)).collect();
        let width = labels
            .iter()
            .map(String::len)
            .chain(self.counts.iter().flatten().map(|c| c.to_string().len()))
            .max()
            .unwrap_or(1);
        let mut out = format!("{:>width$}", "");
        for label in &labels {
            out.push_str(&format!(" {label:>width$}"));
        }
        for (label, row) in labels.iter().zip(&self.counts) {
            out.push('\n');
            out.push_str(&format!("{label:>width$}"));
            for count in row {
                out.push_str(&format!(" {count:>width$}"));
            }
        }
        out
    }
}

impl Visualizable for ConfusionMatrix {
    fn render_text(&self) -> Option<String> {
        (!self.counts.is_empty()).then(|| self.render_table())
    }

    /// Row-normalized heatmap, one pixel per cell, white (0) to red (1).
    fn render_image(&self) -> Option<RgbImage> {
        let size = self.counts.len();
        if size == 0 {
            return None;
        }
        let mut pixels = Vec::with_capacity(size * size * 3);
        for row in &self.counts {
            let total: u64 = row.iter().sum();
            for count in row {
                let ratio = if total == 0 { 0.0 } else { *count as f64 / total as f64 };
                let fade = (255.0 * (1.0 - ratio)).round() as u8;
                pixels.extend_from_slice(&[255, fade, fade]);
            }
        }
        Some(RgbImage {
            width: size,
            height: size,
            pixels,
        })
    }
}

impl ClassAware for ConfusionMatrix {
    fn set_class_names(&mut self, class_names: &[String]) {
        self.class_names = class_names.to_vec();
        self.ensure_size(class_names.len());
    }
}

/// Named metrics for one phase.
#[derive(Default)]
pub struct MetricSet {
    metrics: BTreeMap<String, Box<dyn Metric>>,
}

impl fmt::Debug for MetricSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.metrics.keys()).finish()
    }
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, metric: Box<dyn Metric>) {
        self.metrics.insert(name.into(), metric);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Metric> {
        self.metrics.get(name).map(|m| m.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metrics.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn Metric)> {
        self.metrics.iter().map(|(k, m)| (k.as_str(), m.as_ref()))
    }

    /// Zero-state copy of every metric, for another phase.
    pub fn fresh_copy(&self) -> Self {
        Self {
            metrics: self
                .metrics
                .iter()
                .map(|(k, m)| (k.clone(), m.clone_fresh()))
                .collect(),
        }
    }

    pub fn reset_all(&mut self) {
        self.metrics.values_mut().for_each(|m| m.reset());
    }

    /// Prepare training metrics for a new epoch: windowed metrics get the
    /// loader length as their window, and metrics that need it are reset.
    pub fn prepare_for_epoch(&mut self, loader_len: usize) {
        for metric in self.metrics.values_mut() {
            if let Some(windowed) = metric.as_windowed() {
                windowed.set_max_accum(loader_len);
            }
            if metric.needs_reset() {
                metric.reset();
            }
        }
    }

    pub fn set_class_names(&mut self, class_names: &[String]) {
        for metric in self.metrics.values_mut() {
            if let Some(aware) = metric.as_class_aware() {
                aware.set_class_names(class_names);
            }
        }
    }

    pub fn accumulate(&mut self, outputs: &[Vec<f64>], targets: &[Target]) -> Result<()> {
        for metric in self.metrics.values_mut() {
            metric.accumulate(outputs, targets)?;
        }
        Ok(())
    }

    pub fn eval_all(&self) -> BTreeMap<String, MetricValue> {
        self.metrics
            .iter()
            .map(|(k, m)| (k.clone(), m.eval()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn params(value: serde_json::Value) -> Params {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_goal_comparisons() {
        assert!(MetricGoal::Minimize.is_improvement(0.4, 0.5));
        assert!(!MetricGoal::Minimize.is_improvement(0.5, 0.5));
        assert!(MetricGoal::Maximize.is_improvement(0.6, 0.5));
        assert!(!MetricGoal::Maximize.is_improvement(0.4, 0.5));
        assert_eq!(serde_json::to_value(MetricGoal::Maximize).unwrap(), json!("maximize"));
    }

    #[test]
    fn test_accuracy_top_k() {
        let mut top1 = Accuracy::new(1);
        let mut top2 = Accuracy::new(2);
        let outputs = vec![vec![0.1, 0.7, 0.2], vec![0.5, 0.3, 0.2]];
        let targets = vec![Target::Class(2), Target::Class(0)];
        top1.accumulate(&outputs, &targets).unwrap();
        top2.accumulate(&outputs, &targets).unwrap();
        assert_eq!(top1.eval(), MetricValue::Scalar(0.5));
        assert_eq!(top2.eval(), MetricValue::Scalar(1.0));
    }

    #[test]
    fn test_accuracy_window() {
        let mut metric = Accuracy::new(1);
        assert!(metric.needs_reset());
        metric.set_max_accum(2);
        assert!(!metric.needs_reset());

        let hit = (vec![vec![1.0, 0.0]], vec![Target::Class(0)]);
        let miss = (vec![vec![1.0, 0.0]], vec![Target::Class(1)]);
        metric.accumulate(&miss.0, &miss.1).unwrap();
        metric.accumulate(&hit.0, &hit.1).unwrap();
        metric.accumulate(&hit.0, &hit.1).unwrap();
        // oldest batch (the miss) has left the window
        assert_eq!(metric.eval(), MetricValue::Scalar(1.0));
    }

    #[test]
    fn test_accuracy_params() {
        let metric = Accuracy::from_params(&params(json!({"top_k": 3}))).unwrap();
        assert_eq!(metric.summary(), "top-3 accuracy");
        assert!(Accuracy::from_params(&params(json!({"top_k": 0}))).unwrap_err().is_config());
        assert!(Accuracy::from_params(&params(json!({"k": 1}))).unwrap_err().is_config());
    }

    #[test]
    fn test_mae() {
        let mut metric = Mae::default();
        metric
            .accumulate(
                &[vec![1.0, 2.0], vec![0.0, 0.0]],
                &[Target::Values(vec![0.0, 2.0]), Target::Values(vec![1.0, 1.0])],
            )
            .unwrap();
        assert_eq!(metric.eval(), MetricValue::Scalar(0.75));
        assert_eq!(metric.goal(), Some(MetricGoal::Minimize));
        metric.reset();
        assert_eq!(metric.eval(), MetricValue::Scalar(0.0));
    }

    #[test]
    fn test_confusion_matrix_capabilities() {
        let mut metric = ConfusionMatrix::default();
        assert!(metric.goal().is_none());
        assert!(!metric.is_scalar());
        metric
            .as_class_aware()
            .unwrap()
            .set_class_names(&["cat".to_string(), "dog".to_string()]);
        metric
            .accumulate(
                &[vec![0.9, 0.1], vec![0.2, 0.8], vec![0.6, 0.4]],
                &[Target::Class(0), Target::Class(1), Target::Class(1)],
            )
            .unwrap();
        assert_eq!(metric.counts(), &[vec![1u64, 0], vec![1, 1]]);

        let vis = metric.as_visualizable().unwrap();
        let text = vis.render_text().unwrap();
        assert!(text.contains("cat") && text.contains("dog"));
        let image = vis.render_image().unwrap();
        assert_eq!(image.pixels.len(), 2 * 2 * 3);
        assert!(image.to_ppm().starts_with(b"P6\n2 2\n255\n"));
    }

    #[test]
    fn test_metric_set_copies_are_independent() {
        let mut train = MetricSet::new();
        train.insert("accuracy", Box::new(Accuracy::new(1)));
        train.insert("confusion", Box::new(ConfusionMatrix::default()));
        train
            .accumulate(&[vec![1.0, 0.0]], &[Target::Class(0)])
            .unwrap();

        let valid = train.fresh_copy();
        assert_eq!(valid.len(), 2);
        assert_eq!(valid.eval_all()["accuracy"], MetricValue::Scalar(0.0));
        assert_eq!(train.eval_all()["accuracy"], MetricValue::Scalar(1.0));
    }

    #[test]
    fn test_prepare_for_epoch() {
        let mut set = MetricSet::new();
        set.insert("accuracy", Box::new(Accuracy::new(1)));
        set.accumulate(&[vec![1.0, 0.0]], &[Target::Class(0)]).unwrap();
        set.prepare_for_epoch(10);
        // windowed accuracy keeps its history across epochs
        assert_eq!(set.eval_all()["accuracy"], MetricValue::Scalar(1.0));
    }
}
