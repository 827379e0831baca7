//! # vigil-core
//!
//! Foundation types shared by the vigil crates: the error taxonomy, the
//! declarative session configuration and its layered loader, atomic
//! persistence helpers, the immutable [`Session`] descriptor, and the
//! session-scoped [`SessionLog`].

pub mod config;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod session;

pub use config::{
    ComponentConfig, LoadedConfig, LossConfig, OptimizationConfig, Params, SessionConfig,
    TrainerConfig, load_config,
};
pub use error::{CheckpointError, ConfigError, ResourceError, Result, VigilError};
pub use logging::{SessionLog, SessionScope};
pub use session::Session;
