//! # vigil-train: training orchestration
//!
//! Resolves declarative session configuration into devices, loss, metrics and
//! optimization, then drives the train/validate/test loop, tracks the
//! monitored metric and keeps training resumable through checkpoints.
//!
//! ## Layout
//!
//! 1. **Resources**: [`device`], [`weights`], [`components`]
//! 2. **Collaborator boundary**: [`model`], [`data`], [`executor`]
//! 3. **Bookkeeping**: [`monitor`], [`outputs`], [`checkpoint`], [`telemetry`]
//! 4. **Orchestration**: [`trainer`], plus the built-in [`classification`] executor

// Resources
pub mod components;
pub mod device;
pub mod weights;

// Collaborator boundary
pub mod data;
pub mod executor;
pub mod model;

// Bookkeeping
pub mod checkpoint;
pub mod monitor;
pub mod outputs;
pub mod telemetry;

// Orchestration
pub mod classification;
pub mod trainer;

// Re-exports
pub use checkpoint::{CheckpointRecord, CheckpointStore};
pub use classification::ClassificationExecutor;
pub use components::{ComponentFactory, MetricGoal, MetricSet, MetricValue};
pub use data::{InMemoryLoader, LabeledBatch, Loader, Target};
pub use device::{DeviceAssignment, DeviceDispatcher, PhaseDevices, Placement};
pub use executor::{EvalPass, Phase, PhaseExecutor, TrainOutcome, TrainPass};
pub use model::{Differentiable, LinearModel, Model, StateDict, TaskDescriptor};
pub use monitor::{MetricMonitor, MonitorSource};
pub use outputs::{EpochOutputs, OutputHistory, PhaseResult};
pub use trainer::{Loaders, Trainer, TrainingEnv};
pub use weights::{ClassWeightResolver, ClassWeights, Distribution, WeightPolicy};
