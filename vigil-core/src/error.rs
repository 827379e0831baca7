//! Error types for vigil.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration, checkpoint, and compute-resource failures. Every
//! variant is fatal to the run that raised it; nothing here is retried.

use std::path::PathBuf;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, VigilError>;

/// Top-level error type for vigil.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Phase execution failed: {0}")]
    Phase(String),

    #[error("Invalid training state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VigilError {
    pub fn phase(msg: impl Into<String>) -> Self {
        Self::Phase(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Returns `true` for errors raised by declarative configuration.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub fn is_checkpoint(&self) -> bool {
        matches!(self, Self::Checkpoint(_))
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, Self::Resource(_))
    }
}

/// Errors from declarative configuration: malformed or missing fields, unknown
/// identifiers, and monitored-metric mismatches.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{section} config missing '{field}' field")]
    MissingField { section: String, field: String },

    #[error("invalid value for '{field}': {message}")]
    Invalid { field: String, message: String },

    #[error("unknown {kind} type '{name}'")]
    UnknownComponent { kind: String, name: String },

    #[error("unknown device '{token}' in field '{field}'")]
    UnknownDevice { field: String, token: String },

    #[error("must provide at least one loader with available data")]
    NoDataSource,

    #[error("missing {phase} data, invalid loader")]
    MissingLoader { phase: String },

    #[error("monitored metric '{name}' should be declared in config 'metrics' field")]
    MonitorNotDeclared { name: String },

    #[error("monitored metric '{name}' missing from {phase} metrics")]
    MonitorMissing { name: String, phase: String },

    #[error("metric '{name}' does not define a minimize/maximize goal")]
    NoGoal { name: String },

    #[error("configuration parse error: {message}")]
    Parse { message: String },
}

impl ConfigError {
    pub fn missing(section: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField {
            section: section.into(),
            field: field.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn unknown_component(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::UnknownComponent {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Errors from reading or writing training checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {path}")]
    NotFound { path: PathBuf },

    #[error("unreadable checkpoint {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("incompatible checkpoint {path}: {message}")]
    Incompatible { path: PathBuf, message: String },

    #[error("failed to write checkpoint {path}: {message}")]
    WriteFailed { path: PathBuf, message: String },
}

/// Errors from resolving compute targets.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("accelerator not available, cannot use in '{field}' field")]
    AcceleratorUnavailable { field: String },

    #[error(
        "accelerator device 'cuda:{index}' in field '{field}' out of range (detected device count = {available})"
    )]
    DeviceOutOfRange {
        field: String,
        index: usize,
        available: usize,
    },
}
