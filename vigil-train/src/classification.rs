//! Phase executor for single-label classification.

use tracing::debug;

use crate::components::MetricSet;
use crate::data::{LabeledBatch, Loader, Target};
use crate::device::Placement;
use crate::executor::{EvalPass, PhaseExecutor, TrainOutcome, TrainPass};
use crate::model::{Differentiable, StateDict, TaskDescriptor};
use vigil_core::{Result, VigilError};

/// Runs forward/backward passes over labeled batches. Gradients are averaged
/// over each batch and the optimizer steps once per batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassificationExecutor;

impl ClassificationExecutor {
    pub fn new() -> Self {
        Self
    }
}

fn targets_for(task: &TaskDescriptor, batch: &LabeledBatch) -> Result<Vec<Target>> {
    if batch.labels.len() != batch.inputs.len() {
        return Err(VigilError::phase(format!(
            "batch has {} inputs but {} labels",
            batch.inputs.len(),
            batch.labels.len()
        )));
    }
    batch
        .labels
        .iter()
        .map(|label| {
            task.class_index(label)
                .map(Target::Class)
                .ok_or_else(|| VigilError::phase(format!("unknown class label '{label}'")))
        })
        .collect()
}

fn add_grads(total: &mut StateDict, grads: StateDict) {
    for (name, grad) in grads {
        match total.get_mut(&name) {
            Some(acc) => acc.iter_mut().zip(&grad).for_each(|(a, g)| *a += g),
            None => {
                total.insert(name, grad);
            }
        }
    }
}

fn monitored(metrics: &MetricSet, name: &str) -> Option<f64> {
    metrics.get(name).and_then(|m| m.eval().as_scalar())
}

impl<M, L> PhaseExecutor<M, L> for ClassificationExecutor
where
    M: Differentiable,
    L: Loader<Batch = LabeledBatch>,
{
    fn train_epoch(&mut self, pass: TrainPass<'_, M, L>) -> Result<TrainOutcome> {
        let TrainPass {
            model,
            epoch,
            mut iter,
            placement,
            loader,
            metrics,
            loss,
            optimizer,
            mut writer,
            monitor,
        } = pass;
        let task = model.task().clone();
        let batches = loader.len();
        let mut loss_sum = 0.0;
        let mut samples = 0usize;

        for (idx, batch) in loader.batches().enumerate() {
            if batch.is_empty() {
                continue;
            }
            let targets = targets_for(&task, &batch)?;
            let scale = 1.0 / targets.len() as f64;
            let mut outputs = Vec::with_capacity(targets.len());
            let mut grads = StateDict::new();
            let mut batch_loss = 0.0;
            for (input, target) in batch.inputs.into_iter().zip(&targets) {
                let input = placement.upload_tensor(input);
                let output = model.forward(&input.data);
                batch_loss += loss.compute(&output, target)?;
                let output_grad = loss.gradient(&output, target)?;
                add_grads(&mut grads, model.backward(&input.data, &output_grad));
                outputs.push(output);
            }
            grads
                .values_mut()
                .for_each(|g| g.iter_mut().for_each(|v| *v *= scale));
            optimizer.step(model.parameters_mut(), &grads)?;
            iter += 1;
            metrics.accumulate(&outputs, &targets)?;

            let mean_loss = batch_loss * scale;
            loss_sum += batch_loss;
            samples += targets.len();
            if let Some(w) = writer.as_deref_mut() {
                w.add_scalar("iter/loss", mean_loss, iter);
                w.add_scalar("iter/lr", optimizer.learning_rate(), iter);
                for (name, metric) in metrics.iter().filter(|(_, m)| m.is_scalar()) {
                    if let Some(value) = metric.eval().as_scalar() {
                        w.add_scalar(&format!("iter/{name}"), value, iter);
                    }
                }
            }
            debug!(
                "train epoch {epoch} batch {}/{batches}: loss = {mean_loss:.6}, {monitor} = {:?}",
                idx + 1,
                monitored(metrics, monitor)
            );
        }

        let loss = if samples == 0 { 0.0 } else { loss_sum / samples as f64 };
        Ok(TrainOutcome { loss, iter })
    }

    fn eval_epoch(&mut self, pass: EvalPass<'_, M, L>) -> Result<Option<f64>> {
        let EvalPass {
            phase,
            model,
            epoch,
            placement,
            loader,
            metrics,
            loss,
            monitor,
            ..
        } = pass;
        let task = model.task();
        let mut loss_sum = 0.0;
        let mut samples = 0usize;

        for batch in loader.batches() {
            let targets = targets_for(task, &batch)?;
            let mut outputs = Vec::with_capacity(targets.len());
            for (input, target) in batch.inputs.into_iter().zip(&targets) {
                let input = placement.upload_tensor(input);
                let output = model.forward(&input.data);
                loss_sum += loss.compute(&output, target)?;
                outputs.push(output);
            }
            samples += targets.len();
            metrics.accumulate(&outputs, &targets)?;
        }

        debug!(
            "{phase} epoch {epoch}: {samples} samples, {monitor} = {:?}",
            monitored(metrics, monitor)
        );
        Ok((samples > 0).then(|| loss_sum / samples as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{Accuracy, CrossEntropy, Optimizer, Sgd};
    use crate::data::InMemoryLoader;
    use crate::device::Device;
    use crate::executor::Phase;
    use crate::model::LinearModel;

    fn loader() -> InMemoryLoader<LabeledBatch> {
        InMemoryLoader::labeled(vec![LabeledBatch::new(
            vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            vec!["a".into(), "b".into()],
        )])
    }

    fn metrics() -> MetricSet {
        let mut set = MetricSet::new();
        set.insert("accuracy", Box::new(Accuracy::new(1)));
        set
    }

    #[test]
    fn test_training_separates_classes() {
        let mut model = LinearModel::new(TaskDescriptor::classification(["a", "b"]), 2);
        let loader = loader();
        let placement = Placement::Single(Device::Cpu);
        let loss = CrossEntropy::new(None);
        let mut optimizer = Sgd::new(0.5);
        let mut executor = ClassificationExecutor::new();

        let mut iter = 0;
        let mut last = f64::INFINITY;
        for epoch in 1..=10 {
            let mut train_metrics = metrics();
            let outcome = executor
                .train_epoch(TrainPass {
                    model: &mut model,
                    epoch,
                    iter,
                    placement: &placement,
                    loader: &loader,
                    metrics: &mut train_metrics,
                    loss: &loss,
                    optimizer: &mut optimizer,
                    writer: None,
                    monitor: "accuracy",
                })
                .unwrap();
            assert_eq!(outcome.iter, iter + 1);
            assert!(outcome.loss <= last);
            last = outcome.loss;
            iter = outcome.iter;
        }

        let mut eval_metrics = metrics();
        let eval_loss = executor
            .eval_epoch(EvalPass {
                phase: Phase::Valid,
                model: &model,
                epoch: 10,
                iter,
                placement: &placement,
                loader: &loader,
                metrics: &mut eval_metrics,
                loss: &loss,
                writer: None,
                monitor: "accuracy",
            })
            .unwrap();
        assert!(eval_loss.unwrap() < std::f64::consts::LN_2);
        assert_eq!(eval_metrics.get("accuracy").unwrap().eval().as_scalar(), Some(1.0));
        assert!(optimizer.learning_rate() > 0.0);
    }

    #[test]
    fn test_unknown_label_fails_phase() {
        let model = LinearModel::new(TaskDescriptor::classification(["a", "b"]), 2);
        let loader = InMemoryLoader::labeled(vec![LabeledBatch::new(
            vec![vec![1.0, 0.0]],
            vec!["zebra".into()],
        )]);
        let mut set = metrics();
        let err = ClassificationExecutor
            .eval_epoch(EvalPass {
                phase: Phase::Test,
                model: &model,
                epoch: 0,
                iter: 0,
                placement: &Placement::Single(Device::Cpu),
                loader: &loader,
                metrics: &mut set,
                loss: &CrossEntropy::new(None),
                writer: None,
                monitor: "accuracy",
            })
            .unwrap_err();
        assert!(matches!(err, VigilError::Phase(_)));
        assert!(err.to_string().contains("zebra"));
    }
}
