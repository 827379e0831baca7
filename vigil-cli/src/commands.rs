//! CLI subcommand handlers.

use anyhow::{Context, bail};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::{CkptAction, Commands};
use vigil_core::load_config;
use vigil_train::weights::{ClassWeightResolver, WeightPolicy};
use vigil_train::{
    CheckpointStore, ComponentFactory, DeviceDispatcher, MetricMonitor, MonitorSource, Phase,
    PhaseDevices, TaskDescriptor,
};

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Check {
            config,
            eval,
            accelerators,
        } => handle_check(&config, !eval, dispatcher(accelerators)),
        Commands::Devices {
            spec,
            field,
            accelerators,
        } => handle_devices(&spec, &field, &dispatcher(accelerators)),
        Commands::Weights {
            counts,
            distribution,
            max,
            no_normalize,
            named,
        } => {
            let policy = WeightPolicy {
                distribution: distribution.parse()?,
                max_weight: max.unwrap_or(f64::INFINITY),
                normalize: !no_normalize,
            };
            println!("{}", weights_json(&counts, policy, named)?);
            Ok(())
        }
        Commands::Ckpt { action } => match action {
            CkptAction::Show { path } => handle_ckpt_show(&path),
            CkptAction::List { dir } => handle_ckpt_list(&dir),
        },
    }
}

fn dispatcher(accelerators: Option<usize>) -> DeviceDispatcher {
    accelerators.map_or_else(DeviceDispatcher::default, DeviceDispatcher::with_accelerators)
}

fn handle_check(path: &Path, training: bool, dispatcher: DeviceDispatcher) -> anyhow::Result<()> {
    let loaded = load_config(path)?;
    let trainer = &loaded.session.trainer;
    trainer.validate(training)?;

    let factory = ComponentFactory::with_builtins();
    debug!("{factory:?}");
    let metrics = factory.build_metrics(trainer.metrics.as_ref().context("no metrics section")?)?;
    let monitor_name = trainer.monitor.as_deref().context("no monitor field")?;
    let monitor = MetricMonitor::new(monitor_name, &metrics, MonitorSource::Valid)?;

    // Class weights depend on loader statistics, so the loss is built as for a
    // task without a label schema.
    let task = TaskDescriptor::Generic {
        name: loaded.session.name.clone().unwrap_or_default(),
    };
    let loss = factory.build_loss(trainer.loss.as_ref().context("no loss section")?, &task, None)?;

    let devices = PhaseDevices::resolve(&dispatcher, trainer)?;

    println!("configuration: {}", path.display());
    println!("  mode: {}", if training { "train" } else { "eval" });
    if training {
        let optimization = factory
            .build_optimization(trainer.optimization.as_ref().context("no optimization section")?)?;
        println!("  epochs: {}", trainer.epoch_count(true));
        println!("  save_freq: {}", trainer.save_freq);
        println!("  optimizer: {}", optimization.optimizer.name());
        if let Some(scheduler) = &optimization.scheduler {
            println!("  scheduler: {}", scheduler.name());
        }
    }
    println!("  loss: {}", loss.name());
    println!(
        "  metrics: {}",
        metrics.names().collect::<Vec<_>>().join(", ")
    );
    println!("  monitor: {} ({})", monitor.name(), monitor.goal());
    for phase in Phase::ALL {
        println!("  {}: {}", phase.device_field(), devices.get(phase));
    }
    Ok(())
}

fn handle_devices(spec: &str, field: &str, dispatcher: &DeviceDispatcher) -> anyhow::Result<()> {
    let assignment = dispatcher.resolve(field, spec)?;
    let placement = dispatcher.placement(&assignment);
    println!("accelerators: {}", dispatcher.accelerator_count());
    println!("assignment: {assignment}");
    println!("placement: {placement}");
    Ok(())
}

/// Parse `name=count` pairs, keeping their order.
fn parse_counts(pairs: &[String]) -> anyhow::Result<(Vec<String>, BTreeMap<String, u64>)> {
    let mut order = Vec::with_capacity(pairs.len());
    let mut counts = BTreeMap::new();
    for pair in pairs {
        let (name, count) = pair
            .split_once('=')
            .with_context(|| format!("expected name=count, got '{pair}'"))?;
        let count: u64 = count
            .trim()
            .parse()
            .with_context(|| format!("invalid count in '{pair}'"))?;
        let name = name.trim().to_string();
        if counts.insert(name.clone(), count).is_some() {
            bail!("class '{name}' given more than once");
        }
        order.push(name);
    }
    Ok((order, counts))
}

fn weights_json(pairs: &[String], policy: WeightPolicy, named: bool) -> anyhow::Result<String> {
    let (order, counts) = parse_counts(pairs)?;
    let weights = ClassWeightResolver::new(policy).resolve(&counts, &order)?;
    Ok(serde_json::to_string_pretty(&weights.to_param(!named))?)
}

fn handle_ckpt_show(path: &Path) -> anyhow::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let record = CheckpointStore::new(dir).load(path)?;
    println!("checkpoint: {}", path.display());
    println!("  session: {}", record.name);
    println!("  epoch: {}  iter: {}", record.epoch, record.iter);
    println!("  saved: {} on {}", record.time, record.host);
    match record.monitor_best {
        Some(best) => println!("  monitor best: {best}"),
        None => println!("  monitor best: -"),
    }
    let values: usize = record.model_state.values().map(Vec::len).sum();
    println!(
        "  model: {} tensors, {values} values",
        record.model_state.len()
    );
    if let Some(fingerprint) = record.model_fingerprint() {
        println!("  architecture: {}", &fingerprint[..12.min(fingerprint.len())]);
    }
    println!("  history: {} epochs", record.history.len());
    for (key, value) in record.outputs.flatten() {
        println!("    {key}: {value}");
    }
    Ok(())
}

fn handle_ckpt_list(dir: &Path) -> anyhow::Result<()> {
    let store = CheckpointStore::new(dir);
    let records = store.list()?;
    if records.is_empty() && !store.best_path().exists() {
        println!("no checkpoints in {}", dir.display());
        return Ok(());
    }
    for path in &records {
        println!("{}", path.display());
    }
    if store.best_path().exists() {
        let best = store.load_best()?;
        println!("{} (epoch {})", store.best_path().display(), best.epoch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn pairs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_counts_keeps_order() {
        let (order, counts) = parse_counts(&pairs(&["dog=10", "cat = 30"])).unwrap();
        assert_eq!(order, vec!["dog".to_string(), "cat".to_string()]);
        assert_eq!(counts["cat"], 30);
    }

    #[test]
    fn test_parse_counts_rejects_bad_pairs() {
        assert!(parse_counts(&pairs(&["dog"])).is_err());
        assert!(parse_counts(&pairs(&["dog=x"])).is_err());
        assert!(parse_counts(&pairs(&["dog=1", "dog=2"])).is_err());
    }

    #[test]
    fn test_weights_json() {
        let policy = WeightPolicy {
            normalize: false,
            ..WeightPolicy::default()
        };
        let json = weights_json(&pairs(&["a=10", "b=5"]), policy, false).unwrap();
        let dense: Vec<f64> = serde_json::from_str(&json).unwrap();
        assert_eq!(dense, vec![1.0, 2.0]);

        let json = weights_json(&pairs(&["a=10", "b=5"]), policy, true).unwrap();
        let named: BTreeMap<String, f64> = serde_json::from_str(&json).unwrap();
        assert_eq!(named["b"], 2.0);
    }

    #[test]
    fn test_check_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(
            &path,
            r#"{
                "name": "cli",
                "trainer": {
                    "epochs": 2,
                    "optimization": {"optimizer": {"type": "adam"}},
                    "loss": {"type": "cross_entropy", "params": {}},
                    "metrics": {"accuracy": {"type": "accuracy", "params": {"top_k": 1}}},
                    "monitor": "accuracy",
                    "train_device": "cuda:1"
                }
            }"#,
        )
        .unwrap();
        handle_check(&path, true, DeviceDispatcher::with_accelerators(2)).unwrap();

        let err = handle_check(&path, true, DeviceDispatcher::with_accelerators(1)).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_ckpt_list_empty_dir() {
        let dir = TempDir::new().unwrap();
        handle_ckpt_list(dir.path()).unwrap();
    }
}
