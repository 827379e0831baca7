//! The training loop.
//!
//! A [`Trainer`] is built once per session. Construction resolves every
//! declarative section eagerly (devices, loss, metrics, monitor, optimizer),
//! writes the configuration backup and, when given a checkpoint, restores the
//! training state. [`Trainer::train`] then drives
//! `EPOCH(k)` for `k = current_epoch + 1 ..= epochs`, followed by a test pass
//! on the best checkpoint when a test loader exists. [`Trainer::eval`] runs the
//! validation and/or test phases once against the current model.
//!
//! Both entry points run inside the session's logging scope.

use std::sync::Arc;
use tracing::{debug, error, info};

use crate::checkpoint::{self, CheckpointRecord, CheckpointStore};
use crate::components::{ComponentFactory, Loss, MetricSet, registry::Optimization};
use crate::data::Loader;
use crate::device::{DeviceDispatcher, PhaseDevices, Placement};
use crate::executor::{EvalPass, Phase, PhaseExecutor, TrainPass};
use crate::model::Model;
use crate::monitor::{MetricMonitor, MonitorSource};
use crate::outputs::{EpochOutputs, OutputHistory, PhaseResult};
use crate::telemetry::{PhaseWriters, write_epoch_metrics};
use vigil_core::{
    CheckpointError, ConfigError, Result, Session, SessionConfig, SessionLog, VigilError,
};

/// Data sources of a session, one optional loader per phase.
#[derive(Debug, Clone)]
pub struct Loaders<L> {
    pub train: Option<L>,
    pub valid: Option<L>,
    pub test: Option<L>,
}

impl<L> Default for Loaders<L> {
    fn default() -> Self {
        Self {
            train: None,
            valid: None,
            test: None,
        }
    }
}

impl<L: Loader> Loaders<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_train(mut self, loader: L) -> Self {
        self.train = Some(loader);
        self
    }

    pub fn with_valid(mut self, loader: L) -> Self {
        self.valid = Some(loader);
        self
    }

    pub fn with_test(mut self, loader: L) -> Self {
        self.test = Some(loader);
        self
    }

    pub fn get(&self, phase: Phase) -> Option<&L> {
        match phase {
            Phase::Train => self.train.as_ref(),
            Phase::Valid => self.valid.as_ref(),
            Phase::Test => self.test.as_ref(),
        }
    }

    pub fn has(&self, phase: Phase) -> bool {
        self.get(phase).is_some()
    }

    /// `true` when no phase has a loader.
    pub fn is_empty(&self) -> bool {
        Phase::ALL.iter().all(|p| !self.has(*p))
    }

    /// First available loader in train, valid, test order.
    pub fn first(&self) -> Option<&L> {
        Phase::ALL.iter().find_map(|p| self.get(*p))
    }

    // Loaders without a single batch count as absent.
    fn without_empty(self) -> Self {
        let keep = |phase: Phase, loader: Option<L>| {
            loader.filter(|l| {
                if l.is_empty() {
                    debug!("{phase} loader has no batches, ignoring it");
                }
                !l.is_empty()
            })
        };
        Self {
            train: keep(Phase::Train, self.train),
            valid: keep(Phase::Valid, self.valid),
            test: keep(Phase::Test, self.test),
        }
    }
}

/// Independent metric instances for each phase.
#[derive(Debug)]
pub struct PhaseMetrics {
    train: MetricSet,
    valid: MetricSet,
    test: MetricSet,
}

impl PhaseMetrics {
    /// Three zero-state copies of `template`.
    pub fn from_template(template: &MetricSet) -> Self {
        Self {
            train: template.fresh_copy(),
            valid: template.fresh_copy(),
            test: template.fresh_copy(),
        }
    }

    pub fn get(&self, phase: Phase) -> &MetricSet {
        match phase {
            Phase::Train => &self.train,
            Phase::Valid => &self.valid,
            Phase::Test => &self.test,
        }
    }

    fn get_mut(&mut self, phase: Phase) -> &mut MetricSet {
        match phase {
            Phase::Train => &mut self.train,
            Phase::Valid => &mut self.valid,
            Phase::Test => &mut self.test,
        }
    }

    fn set_class_names(&mut self, class_names: &[String]) {
        for phase in Phase::ALL {
            self.get_mut(phase).set_class_names(class_names);
        }
    }
}

/// Process-level collaborators and options for building a [`Trainer`].
#[derive(Debug)]
pub struct TrainingEnv {
    pub factory: ComponentFactory,
    pub dispatcher: DeviceDispatcher,
    /// Checkpoint to resume from.
    pub resume: Option<CheckpointRecord>,
    /// Echo session logs to stderr in addition to the log file.
    pub echo_stderr: bool,
}

impl Default for TrainingEnv {
    fn default() -> Self {
        Self {
            factory: ComponentFactory::with_builtins(),
            dispatcher: DeviceDispatcher::default(),
            resume: None,
            echo_stderr: true,
        }
    }
}

impl TrainingEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factory(mut self, factory: ComponentFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DeviceDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Use a fixed accelerator count instead of probing the environment.
    pub fn with_accelerators(self, count: usize) -> Self {
        self.with_dispatcher(DeviceDispatcher::with_accelerators(count))
    }

    pub fn with_resume(mut self, record: CheckpointRecord) -> Self {
        self.resume = Some(record);
        self
    }

    /// Log to the session file only.
    pub fn quiet(mut self) -> Self {
        self.echo_stderr = false;
        self
    }
}

/// Orchestrates one training session.
pub struct Trainer<M, L, E> {
    session: Session,
    raw_config: serde_json::Value,
    model: M,
    loaders: Loaders<L>,
    executor: E,
    dispatcher: DeviceDispatcher,
    devices: PhaseDevices,
    loss: Box<dyn Loss>,
    metrics: PhaseMetrics,
    monitor: MetricMonitor,
    optimization: Option<Optimization>,
    writers: PhaseWriters,
    store: CheckpointStore,
    log: Arc<SessionLog>,
    host: String,
    current_epoch: usize,
    current_iter: u64,
    history: OutputHistory,
}

impl<M, L, E> std::fmt::Debug for Trainer<M, L, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("session", &self.session.name())
            .field("devices", &self.devices)
            .field("monitor", &self.monitor)
            .field("current_epoch", &self.current_epoch)
            .field("current_iter", &self.current_iter)
            .finish_non_exhaustive()
    }
}

impl<M, L, E> Trainer<M, L, E>
where
    M: Model,
    L: Loader,
    E: PhaseExecutor<M, L>,
{
    /// Build a trainer, failing before any compute is touched if the
    /// configuration, devices or resume checkpoint are unusable.
    pub fn new(
        session: Session,
        config: &SessionConfig,
        raw_config: serde_json::Value,
        mut model: M,
        loaders: Loaders<L>,
        executor: E,
        env: TrainingEnv,
    ) -> Result<Self> {
        let loaders = loaders.without_empty();
        if loaders.is_empty() {
            return Err(ConfigError::NoDataSource.into());
        }
        let training = loaders.has(Phase::Train);
        let trainer_config = &config.trainer;
        trainer_config.validate(training)?;

        let TrainingEnv {
            factory,
            dispatcher,
            resume,
            echo_stderr,
        } = env;

        let log = Arc::new(if echo_stderr {
            SessionLog::create(&session.log_dir(), session.name())?
        } else {
            SessionLog::file_only(&session.log_dir(), session.name())?
        });
        let scope_log = Arc::clone(&log);
        let _scope = scope_log.enter();
        info!("created training log for session '{}'", session.name());

        let devices = PhaseDevices::resolve(&dispatcher, trainer_config)?;
        for phase in Phase::ALL {
            debug!("{} = {}", phase.device_field(), devices.get(phase));
        }

        let loss_config = trainer_config
            .loss
            .as_ref()
            .ok_or_else(|| ConfigError::missing("trainer", "loss"))?;
        let class_counts = loaders.first().and_then(|l| l.class_counts());
        let loss = factory.build_loss(loss_config, model.task(), class_counts.as_ref())?;

        let metric_configs = trainer_config
            .metrics
            .as_ref()
            .ok_or_else(|| ConfigError::missing("trainer", "metrics"))?;
        let template = factory.build_metrics(metric_configs)?;
        let mut metrics = PhaseMetrics::from_template(&template);
        if model.task().is_classification() {
            metrics.set_class_names(model.task().class_names());
        }

        let monitor_name = trainer_config
            .monitor
            .as_deref()
            .ok_or_else(|| ConfigError::missing("trainer", "monitor"))?;
        let mut monitor = MetricMonitor::new(
            monitor_name,
            &template,
            MonitorSource::for_session(loaders.has(Phase::Valid)),
        )?;
        info!(
            "monitoring '{monitor_name}' ({}) on the {} phase",
            monitor.goal(),
            monitor.source().phase()
        );

        let mut optimization = if training {
            let section = trainer_config
                .optimization
                .as_ref()
                .ok_or_else(|| ConfigError::missing("trainer", "optimization"))?;
            let built = factory.build_optimization(section)?;
            debug!("optimization: {built:?}");
            Some(built)
        } else {
            None
        };

        let host = checkpoint::host();
        let writers = PhaseWriters::new(
            trainer_config.use_tbx,
            session.tbx_root(),
            &host,
            &checkpoint::timestamp(),
        );
        writers.check_fresh()?;
        let store = CheckpointStore::new(session.checkpoint_dir());
        session.write_config_backup(&raw_config)?;

        let mut current_epoch = 0;
        let mut current_iter = 0;
        let mut history = OutputHistory::new();
        if let Some(record) = resume {
            let path = store.dir().join(record.file_name());
            if record.task != *model.task() {
                return Err(CheckpointError::Incompatible {
                    path,
                    message: "checkpoint task does not match the model task".to_string(),
                }
                .into());
            }
            info!("resuming from checkpoint @ epoch {}", record.epoch);
            model.load_state_dict(&record.model_state)?;
            if let (Some(optim), Some(state)) = (optimization.as_mut(), &record.optimizer_state) {
                optim.optimizer.load_state(state)?;
            }
            monitor.restore(record.monitor_best);
            current_epoch = record.epoch;
            current_iter = record.iter;
            history = record.history;
            if history.get(record.epoch).is_none() {
                history.merge_into_epoch(record.epoch, record.outputs);
            }
        }

        Ok(Self {
            session,
            raw_config,
            model,
            loaders,
            executor,
            dispatcher,
            devices,
            loss,
            metrics,
            monitor,
            optimization,
            writers,
            store,
            log,
            host,
            current_epoch,
            current_iter,
            history,
        })
    }

    /// Run the remaining training epochs, then test the best checkpoint when a
    /// test loader exists.
    pub fn train(&mut self) -> Result<()> {
        let log = Arc::clone(&self.log);
        let _scope = log.enter();
        self.run_training()
    }

    /// Run the validation and/or test phases once against the current model.
    /// Results are recorded under the current epoch.
    pub fn eval(&mut self) -> Result<()> {
        let log = Arc::clone(&self.log);
        let _scope = log.enter();
        self.run_eval()
    }

    fn run_training(&mut self) -> Result<()> {
        if !self.loaders.has(Phase::Train) {
            return Err(ConfigError::MissingLoader {
                phase: Phase::Train.to_string(),
            }
            .into());
        }
        let train_placement = self.dispatcher.upload(&mut self.model, &self.devices.train)?;
        let valid_placement = self.dispatcher.placement(&self.devices.valid);
        info!(
            "launching training session '{}' on {train_placement}",
            self.session.name()
        );

        for epoch in self.current_epoch + 1..=self.session.epochs() {
            self.current_epoch = epoch;
            self.step_scheduler(epoch);

            let mut outputs = EpochOutputs::default();
            outputs.set(Phase::Train, self.run_train_pass(epoch, &train_placement)?);
            if self.loaders.has(Phase::Valid) {
                outputs.set(
                    Phase::Valid,
                    self.run_eval_pass(Phase::Valid, epoch, &valid_placement)?,
                );
            }

            let is_best = self.monitor.observe_epoch(&outputs)?;
            for (key, value) in outputs.flatten() {
                debug!("epoch {epoch} result => {key}: {value}");
            }
            self.history.append(epoch, outputs.clone())?;
            if is_best || epoch % self.session.save_freq() == 0 {
                self.save(epoch, outputs, is_best)?;
            }
        }
        info!(
            "training complete, best {} = {:?}",
            self.monitor.name(),
            self.monitor.best()
        );

        if self.loaders.has(Phase::Test) {
            self.run_post_test()?;
        }
        Ok(())
    }

    fn run_eval(&mut self) -> Result<()> {
        if !self.loaders.has(Phase::Valid) && !self.loaders.has(Phase::Test) {
            return Err(ConfigError::MissingLoader {
                phase: "valid/test".to_string(),
            }
            .into());
        }
        let epoch = self.current_epoch;
        let mut outputs = EpochOutputs::default();
        for phase in [Phase::Valid, Phase::Test] {
            if !self.loaders.has(phase) {
                continue;
            }
            let placement = self.dispatcher.upload(&mut self.model, self.devices.get(phase))?;
            outputs.set(phase, self.run_eval_pass(phase, epoch, &placement)?);
        }
        let merged = self.history.merge_into_epoch(epoch, outputs);
        for (key, value) in merged.flatten() {
            info!("epoch {epoch} result => {key}: {value}");
        }
        Ok(())
    }

    /// Reload the best checkpoint, test it, and extend the best epoch's
    /// stored outputs with the test result.
    fn run_post_test(&mut self) -> Result<()> {
        let path = self.store.best_path();
        let record = self.store.load_best()?;
        let backup = self.session.read_config_backup()?;
        self.store
            .verify_compatible(&record, &path, backup.as_ref())?;
        info!("loading best model from epoch {} for testing", record.epoch);
        self.model.load_state_dict(&record.model_state)?;
        let placement = self.dispatcher.upload(&mut self.model, &self.devices.test)?;

        let test = self.run_eval_pass(Phase::Test, record.epoch, &placement)?;
        let update = record.outputs.with(Phase::Test, test);
        let merged = self.history.merge_into_epoch(record.epoch, update);
        for (key, value) in merged.flatten() {
            info!("best epoch {} result => {key}: {value}", record.epoch);
        }
        Ok(())
    }

    fn step_scheduler(&mut self, epoch: usize) {
        let Some(optimization) = self.optimization.as_mut() else {
            return;
        };
        if let Some(scheduler) = &optimization.scheduler {
            let optimizer = &mut optimization.optimizer;
            let lr = scheduler.learning_rate(epoch - 1, optimizer.base_learning_rate());
            optimizer.set_learning_rate(lr);
            info!("epoch {epoch} learning rate: {lr}");
        }
    }

    fn run_train_pass(&mut self, epoch: usize, placement: &Placement) -> Result<PhaseResult> {
        let loader = self.loaders.train.as_ref().ok_or_else(|| ConfigError::MissingLoader {
            phase: Phase::Train.to_string(),
        })?;
        let optimization = self
            .optimization
            .as_mut()
            .ok_or_else(|| VigilError::invalid_state("training requires an optimizer"))?;
        self.metrics.train.prepare_for_epoch(loader.len());
        let writer = self.writers.get(Phase::Train);

        let outcome = self.executor.train_epoch(TrainPass {
            model: &mut self.model,
            epoch,
            iter: self.current_iter,
            placement,
            loader,
            metrics: &mut self.metrics.train,
            loss: self.loss.as_ref(),
            optimizer: optimization.optimizer.as_mut(),
            writer,
            monitor: self.monitor.name(),
        })?;
        if outcome.iter < self.current_iter {
            return Err(VigilError::invalid_state(format!(
                "iteration counter went backwards ({} -> {})",
                self.current_iter, outcome.iter
            )));
        }
        self.current_iter = outcome.iter;

        if let Some(writer) = self.writers.get(Phase::Train) {
            write_epoch_metrics(writer, &self.metrics.train, epoch);
            writer.add_scalar("epoch/loss", outcome.loss, epoch as u64);
        }
        Ok(PhaseResult::new(Some(outcome.loss), self.metrics.train.eval_all()))
    }

    fn run_eval_pass(
        &mut self,
        phase: Phase,
        epoch: usize,
        placement: &Placement,
    ) -> Result<PhaseResult> {
        let loader = self.loaders.get(phase).ok_or_else(|| ConfigError::MissingLoader {
            phase: phase.to_string(),
        })?;
        let metrics = self.metrics.get_mut(phase);
        metrics.reset_all();
        let writer = self.writers.get(phase);

        let loss = self.executor.eval_epoch(EvalPass {
            phase,
            model: &self.model,
            epoch,
            iter: self.current_iter,
            placement,
            loader,
            metrics,
            loss: self.loss.as_ref(),
            writer,
            monitor: self.monitor.name(),
        })?;

        if let Some(writer) = self.writers.get(phase) {
            write_epoch_metrics(writer, self.metrics.get(phase), epoch);
            if let Some(loss) = loss {
                writer.add_scalar("epoch/loss", loss, epoch as u64);
            }
        }
        Ok(PhaseResult::new(loss, self.metrics.get(phase).eval_all()))
    }

    fn save(&mut self, epoch: usize, outputs: EpochOutputs, is_best: bool) -> Result<()> {
        let record = CheckpointRecord {
            name: self.session.name().to_string(),
            epoch,
            iter: self.current_iter,
            time: checkpoint::timestamp(),
            host: self.host.clone(),
            task: self.model.task().clone(),
            outputs,
            history: self.history.clone(),
            model_state: self.model.state_dict(),
            optimizer_state: self.optimization.as_ref().map(|o| o.optimizer.state()),
            monitor_best: self.monitor.best(),
            config: Some(self.raw_config.clone()),
        };
        self.store
            .save(&record, is_best)
            .inspect_err(|e| error!("checkpoint save failed @ epoch {epoch}: {e}"))?;
        Ok(())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    pub fn current_iter(&self) -> u64 {
        self.current_iter
    }

    pub fn monitor(&self) -> &MetricMonitor {
        &self.monitor
    }

    pub fn monitor_best(&self) -> Option<f64> {
        self.monitor.best()
    }

    /// Every recorded epoch's outputs.
    pub fn history(&self) -> &OutputHistory {
        &self.history
    }

    pub fn devices(&self) -> &PhaseDevices {
        &self.devices
    }

    pub fn metrics(&self, phase: Phase) -> &MetricSet {
        self.metrics.get(phase)
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn log_path(&self) -> &std::path::Path {
        self.log.path()
    }
}
