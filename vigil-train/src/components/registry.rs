//! Component registry: resolves `{type, params}` configuration entries to
//! constructed losses, metrics, optimizers and schedulers.
//!
//! Built-in components are registered by [`ComponentFactory::with_builtins`];
//! callers can add their own constructors under new names before building.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use super::loss::{CrossEntropy, Loss, Mse};
use super::metrics::{Accuracy, ConfusionMatrix, Mae, Metric, MetricSet};
use super::optim::{Adam, Optimizer, Sgd};
use super::schedule::{Cosine, Exponential, LrScheduler, MultiStep, StepLr};
use crate::model::TaskDescriptor;
use crate::weights::{ClassWeightResolver, WeightPolicy};
use vigil_core::{ComponentConfig, ConfigError, LossConfig, OptimizationConfig, Params, Result};

pub type LossCtor = fn(&Params) -> Result<Box<dyn Loss>>;
pub type MetricCtor = fn(&Params) -> Result<Box<dyn Metric>>;
pub type OptimizerCtor = fn(&Params) -> Result<Box<dyn Optimizer>>;
pub type SchedulerCtor = fn(&Params) -> Result<Box<dyn LrScheduler>>;

/// Optimizer and optional scheduler built from one optimization section.
pub struct Optimization {
    pub optimizer: Box<dyn Optimizer>,
    pub scheduler: Option<Box<dyn LrScheduler>>,
}

impl std::fmt::Debug for Optimization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Optimization")
            .field("optimizer", &self.optimizer.name())
            .field("scheduler", &self.scheduler.as_ref().map(|s| s.name()))
            .finish()
    }
}

/// Name-to-constructor tables for every component kind.
#[derive(Default)]
pub struct ComponentFactory {
    losses: HashMap<String, LossCtor>,
    metrics: HashMap<String, MetricCtor>,
    optimizers: HashMap<String, OptimizerCtor>,
    schedulers: HashMap<String, SchedulerCtor>,
}

impl std::fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentFactory")
            .field("losses", &sorted_names(&self.losses))
            .field("metrics", &sorted_names(&self.metrics))
            .field("optimizers", &sorted_names(&self.optimizers))
            .field("schedulers", &sorted_names(&self.schedulers))
            .finish()
    }
}

fn sorted_names<V>(table: &HashMap<String, V>) -> Vec<&str> {
    let mut names: Vec<&str> = table.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
}

fn insert_unique<V>(table: &mut HashMap<String, V>, kind: &str, name: &str, ctor: V) -> Result<()> {
    if table.contains_key(name) {
        return Err(ConfigError::invalid(
            name,
            format!("{kind} type '{name}' is already registered"),
        )
        .into());
    }
    debug!(kind, name, "registering component");
    table.insert(name.to_string(), ctor);
    Ok(())
}

impl ComponentFactory {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in component.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.losses.insert("cross_entropy".into(), |p| {
            Ok(Box::new(CrossEntropy::from_params(p)?))
        });
        factory.losses.insert("mse".into(), |p| Ok(Box::new(Mse::from_params(p)?)));
        factory.metrics.insert("accuracy".into(), |p| {
            Ok(Box::new(Accuracy::from_params(p)?))
        });
        factory.metrics.insert("mae".into(), |p| Ok(Box::new(Mae::from_params(p)?)));
        factory.metrics.insert("confusion_matrix".into(), |p| {
            Ok(Box::new(ConfusionMatrix::from_params(p)?))
        });
        factory.optimizers.insert("sgd".into(), |p| Ok(Box::new(Sgd::from_params(p)?)));
        factory.optimizers.insert("adam".into(), |p| Ok(Box::new(Adam::from_params(p)?)));
        factory.schedulers.insert("step_lr".into(), |p| {
            Ok(Box::new(StepLr::from_params(p)?))
        });
        factory.schedulers.insert("multi_step".into(), |p| {
            Ok(Box::new(MultiStep::from_params(p)?))
        });
        factory.schedulers.insert("exponential".into(), |p| {
            Ok(Box::new(Exponential::from_params(p)?))
        });
        factory.schedulers.insert("cosine".into(), |p| {
            Ok(Box::new(Cosine::from_params(p)?))
        });
        factory
    }

    pub fn register_loss(&mut self, name: &str, ctor: LossCtor) -> Result<()> {
        insert_unique(&mut self.losses, "loss", name, ctor)
    }

    pub fn register_metric(&mut self, name: &str, ctor: MetricCtor) -> Result<()> {
        insert_unique(&mut self.metrics, "metric", name, ctor)
    }

    pub fn register_optimizer(&mut self, name: &str, ctor: OptimizerCtor) -> Result<()> {
        insert_unique(&mut self.optimizers, "optimizer", name, ctor)
    }

    pub fn register_scheduler(&mut self, name: &str, ctor: SchedulerCtor) -> Result<()> {
        insert_unique(&mut self.schedulers, "scheduler", name, ctor)
    }

    /// Build the loss. With `weight_classes` set on a classification task,
    /// per-class weights computed from `class_counts` are injected into the
    /// parameters under `weight_param_name` first.
    pub fn build_loss(
        &self,
        config: &LossConfig,
        task: &TaskDescriptor,
        class_counts: Option<&BTreeMap<String, u64>>,
    ) -> Result<Box<dyn Loss>> {
        let kind = config.component.require_kind("loss")?;
        let mut params = config.component.require_params("loss")?.clone();
        if config.weight_classes {
            if task.is_classification() {
                let counts = class_counts.ok_or_else(|| {
                    ConfigError::invalid(
                        "weight_classes",
                        "no data loader provides per-class sample counts",
                    )
                })?;
                let policy = WeightPolicy::from_loss_config(config)?;
                let weights = ClassWeightResolver::new(policy).resolve(counts, task.class_names())?;
                info!(
                    distribution = %policy.distribution,
                    weights = ?weights.named(),
                    "using class weights for loss"
                );
                params.insert(
                    config.weight_param_name.clone(),
                    weights.to_param(config.weight_param_pass_tensor),
                );
            } else {
                debug!("class weighting requested for a non-classification task, skipped");
            }
        }
        let ctor = self
            .losses
            .get(kind)
            .ok_or_else(|| ConfigError::unknown_component("loss", kind))?;
        let loss = ctor(&params)?;
        if let Some(summary) = loss.summary() {
            debug!("loss: {summary}");
        }
        Ok(loss)
    }

    /// Build every named metric.
    pub fn build_metrics(&self, configs: &BTreeMap<String, ComponentConfig>) -> Result<MetricSet> {
        let mut set = MetricSet::new();
        for (name, config) in configs {
            let kind = config.require_kind("metric")?;
            let params = config.require_params("metric")?;
            let ctor = self
                .metrics
                .get(kind)
                .ok_or_else(|| ConfigError::unknown_component("metric", kind))?;
            let metric = ctor(params)?;
            if let Some(summary) = metric.as_summarizable() {
                info!("parsed metric '{name}': {}", summary.summary());
            }
            set.insert(name.clone(), metric);
        }
        Ok(set)
    }

    pub fn build_optimizer(&self, config: &ComponentConfig) -> Result<Box<dyn Optimizer>> {
        let kind = config.require_kind("optimizer")?;
        let ctor = self
            .optimizers
            .get(kind)
            .ok_or_else(|| ConfigError::unknown_component("optimizer", kind))?;
        ctor(config.params.as_ref().unwrap_or(&Params::new()))
    }

    pub fn build_scheduler(&self, config: &ComponentConfig) -> Result<Box<dyn LrScheduler>> {
        let kind = config.require_kind("scheduler")?;
        let ctor = self
            .schedulers
            .get(kind)
            .ok_or_else(|| ConfigError::unknown_component("scheduler", kind))?;
        ctor(config.params.as_ref().unwrap_or(&Params::new()))
    }

    /// Build the optimizer and, when configured, its scheduler.
    pub fn build_optimization(&self, config: &OptimizationConfig) -> Result<Optimization> {
        let optimizer_config = config
            .optimizer
            .as_ref()
            .ok_or_else(|| ConfigError::missing("optimization", "optimizer"))?;
        let optimizer = self.build_optimizer(optimizer_config)?;
        let scheduler = config
            .scheduler
            .as_ref()
            .map(|s| self.build_scheduler(s))
            .transpose()?;
        Ok(Optimization {
            optimizer,
            scheduler,
        })
    }
}
