//! Configuration system for vigil.
//!
//! Uses `figment` for layered configuration: session file -> environment.
//! The session file is TOML or JSON (chosen by extension); environment
//! variables prefixed with `VIGIL_` override any key, with `__` separating
//! nesting levels (`VIGIL_TRAINER__EPOCHS=20`).
//!
//! Every section is optional at the type level so that a missing field can be
//! reported with the section and field name instead of a generic serde error;
//! [`TrainerConfig::validate`] enforces which ones a given mode requires.

use figment::{
    Figment,
    providers::{Env, Format, Json, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{ConfigError, Result};

/// Free-form constructor parameters for a component.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Top-level session document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session name; the CLI falls back to the file stem when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Model architecture descriptor, opaque to the engine. Compared between
    /// the configuration backup and checkpoints before reloading weights.
    #[serde(default)]
    pub model: serde_json::Value,
    /// Trainer section.
    #[serde(default)]
    pub trainer: TrainerConfig,
}

/// A session document as loaded from disk, with the raw JSON kept for the
/// configuration backup.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub session: SessionConfig,
    pub raw: serde_json::Value,
}

/// Declarative trainer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Number of training epochs (required when a train loader exists).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epochs: Option<usize>,
    /// Save a regular checkpoint every `save_freq` epochs.
    #[serde(default = "default_save_freq")]
    pub save_freq: usize,
    /// Enable the per-phase summary writers.
    #[serde(default)]
    pub use_tbx: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization: Option<OptimizationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<LossConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, ComponentConfig>>,
    /// Name of the metric that decides which epoch is "best".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<String>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: None,
            save_freq: default_save_freq(),
            use_tbx: false,
            train_device: None,
            valid_device: None,
            test_device: None,
            optimization: None,
            loss: None,
            metrics: None,
            monitor: None,
        }
    }
}

fn default_save_freq() -> usize {
    1
}

/// `{type, params}` pair resolved through the component registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

impl ComponentConfig {
    pub fn new(kind: &str, params: Params) -> Self {
        Self {
            kind: Some(kind.to_string()),
            params: Some(params),
        }
    }

    /// The component type, rejecting absent or empty identifiers.
    pub fn require_kind(&self, section: &str) -> Result<&str> {
        match self.kind.as_deref() {
            Some(kind) if !kind.trim().is_empty() => Ok(kind),
            _ => Err(ConfigError::missing(section, "type").into()),
        }
    }

    /// The constructor parameters, rejecting an absent `params` field.
    pub fn require_params(&self, section: &str) -> Result<&Params> {
        self.params
            .as_ref()
            .ok_or_else(|| ConfigError::missing(section, "params").into())
    }
}

/// Optimizer plus optional learning-rate scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<ComponentConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<ComponentConfig>,
}

/// Loss component with optional class-frequency weighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(flatten)]
    pub component: ComponentConfig,
    /// Inject per-class weights into the loss parameters.
    #[serde(default)]
    pub weight_classes: bool,
    /// Parameter name the weights are injected under.
    #[serde(default = "default_weight_param_name")]
    pub weight_param_name: String,
    /// `true` passes a dense vector in class-index order, `false` a name map.
    #[serde(default = "default_true")]
    pub weight_param_pass_tensor: bool,
    /// `uniform` or `rootK` (e.g. `root2`).
    #[serde(default = "default_weight_distribution")]
    pub weight_distribution: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_max: Option<f64>,
    #[serde(default = "default_true")]
    pub weight_norm: bool,
}

impl LossConfig {
    pub fn new(component: ComponentConfig) -> Self {
        Self {
            component,
            weight_classes: false,
            weight_param_name: default_weight_param_name(),
            weight_param_pass_tensor: true,
            weight_distribution: default_weight_distribution(),
            weight_max: None,
            weight_norm: true,
        }
    }
}

fn default_weight_param_name() -> String {
    "weight".to_string()
}

fn default_weight_distribution() -> String {
    "uniform".to_string()
}

fn default_true() -> bool {
    true
}

impl TrainerConfig {
    /// Check that every section required by the requested mode is present.
    ///
    /// Training mode needs `epochs`, `optimization`, `loss`, `metrics` and
    /// `monitor`; evaluation-only sessions still need the loss and metrics
    /// to score their phases.
    pub fn validate(&self, training: bool) -> Result<()> {
        if training {
            match self.epochs {
                None => return Err(ConfigError::missing("trainer", "epochs").into()),
                Some(0) => {
                    return Err(ConfigError::invalid("epochs", "epoch count must be positive").into());
                }
                Some(_) => {}
            }
            let optimization = self
                .optimization
                .as_ref()
                .ok_or_else(|| ConfigError::missing("trainer", "optimization"))?;
            optimization
                .optimizer
                .as_ref()
                .ok_or_else(|| ConfigError::missing("optimization", "optimizer"))?
                .require_kind("optimizer")?;
            if let Some(scheduler) = &optimization.scheduler {
                scheduler.require_kind("scheduler")?;
            }
        }
        if self.save_freq == 0 {
            return Err(ConfigError::invalid("save_freq", "save frequency must be at least 1").into());
        }
        let loss = self
            .loss
            .as_ref()
            .ok_or_else(|| ConfigError::missing("trainer", "loss"))?;
        loss.component.require_kind("loss")?;
        loss.component.require_params("loss")?;
        let metrics = self
            .metrics
            .as_ref()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ConfigError::missing("trainer", "metrics"))?;
        for metric in metrics.values() {
            metric.require_kind("metric")?;
            metric.require_params("metric")?;
        }
        let monitor = self
            .monitor
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ConfigError::missing("trainer", "monitor"))?;
        if !metrics.contains_key(monitor) {
            return Err(ConfigError::MonitorNotDeclared {
                name: monitor.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Epoch count for the run: the configured value when training, a single
    /// pass otherwise.
    pub fn epoch_count(&self, training: bool) -> usize {
        if training { self.epochs.unwrap_or(1) } else { 1 }
    }
}

/// Load a session document from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `VIGIL_`)
/// 2. The session file at `path` (`.toml` or `.json`)
pub fn load_config(path: &Path) -> Result<LoadedConfig> {
    if !path.exists() {
        return Err(ConfigError::Parse {
            message: format!("configuration file not found: {}", path.display()),
        }
        .into());
    }
    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        other => {
            return Err(ConfigError::Parse {
                message: format!("unsupported configuration format: {other:?}"),
            }
            .into());
        }
    };
    let figment = figment.merge(Env::prefixed("VIGIL_").split("__"));
    from_figment(&figment)
}

fn from_figment(figment: &Figment) -> Result<LoadedConfig> {
    let raw: serde_json::Value = figment.extract().map_err(|e| ConfigError::Parse {
        message: e.to_string(),
    })?;
    let session: SessionConfig =
        serde_json::from_value(raw.clone()).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
    Ok(LoadedConfig { session, raw })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn training_config() -> TrainerConfig {
        serde_json::from_value(json!({
            "epochs": 3,
            "save_freq": 2,
            "optimization": {
                "optimizer": {"type": "sgd", "params": {"lr": 0.1}},
                "scheduler": {"type": "step_lr", "params": {"step_size": 2}}
            },
            "loss": {"type": "cross_entropy", "params": {}},
            "metrics": {"accuracy": {"type": "accuracy", "params": {}}},
            "monitor": "accuracy"
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = TrainerConfig::default();
        assert_eq!(config.save_freq, 1);
        assert!(!config.use_tbx);
        assert_eq!(config.epoch_count(false), 1);
    }

    #[test]
    fn test_valid_training_config() {
        let config = training_config();
        config.validate(true).unwrap();
        assert_eq!(config.epoch_count(true), 3);
        let loss = config.loss.as_ref().unwrap();
        assert_eq!(loss.weight_param_name, "weight");
        assert!(loss.weight_param_pass_tensor);
        assert_eq!(loss.weight_distribution, "uniform");
    }

    #[test]
    fn test_missing_sections() {
        let mut config = training_config();
        config.optimization = None;
        let err = config.validate(true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: trainer config missing 'optimization' field"
        );
        // Evaluation sessions do not need an optimizer.
        config.validate(false).unwrap();

        let mut config = training_config();
        config.epochs = Some(0);
        assert!(config.validate(true).unwrap_err().is_config());
    }

    #[test]
    fn test_metric_requires_type_and_params() {
        let mut config = training_config();
        config
            .metrics
            .as_mut()
            .unwrap()
            .insert("top5".into(), ComponentConfig { kind: Some("accuracy".into()), params: None });
        let err = config.validate(true).unwrap_err();
        assert!(err.to_string().contains("metric config missing 'params' field"));
    }

    #[test]
    fn test_monitor_must_be_declared() {
        let mut config = training_config();
        config.monitor = Some("loss".into());
        let err = config.validate(true).unwrap_err();
        assert!(err.to_string().contains("monitored metric 'loss'"));
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(
            &path,
            r#"
name = "mnist"

[model]
type = "mlp"

[trainer]
epochs = 4
monitor = "accuracy"

[trainer.loss]
type = "cross_entropy"
params = {}

[trainer.metrics.accuracy]
type = "accuracy"
params = { top_k = 1 }
"#,
        )
        .unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.session.name.as_deref(), Some("mnist"));
        assert_eq!(loaded.session.trainer.epochs, Some(4));
        assert_eq!(loaded.raw["model"]["type"], "mlp");
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("session.ini");
        std::fs::write(&path, "epochs=1").unwrap();
        assert!(load_config(&path).unwrap_err().is_config());
    }
}
