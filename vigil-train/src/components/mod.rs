//! Configurable training components and the registry that builds them.

pub mod loss;
pub mod metrics;
pub mod optim;
pub mod registry;
pub mod schedule;

pub use loss::{CrossEntropy, Loss, Mse};
pub use metrics::{
    AccumulationWindowed, Accuracy, ClassAware, ConfusionMatrix, Mae, Metric, MetricGoal,
    MetricSet, MetricValue, RgbImage, Summarizable, Visualizable,
};
pub use optim::{Adam, Optimizer, Sgd};
pub use registry::ComponentFactory;
pub use schedule::{Cosine, Exponential, LrScheduler, MultiStep, StepLr};

use serde::de::DeserializeOwned;
use vigil_core::{ConfigError, Params, Result};

/// Deserialize constructor parameters, reporting failures against the
/// component type.
pub(crate) fn parse_params<T: DeserializeOwned>(kind: &str, params: &Params) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(params.clone()))
        .map_err(|e| ConfigError::invalid(kind, e.to_string()).into())
}
