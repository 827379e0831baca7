//! Training session descriptor.
//!
//! A [`Session`] names one training run and fixes where everything it produces
//! lives on disk. It is immutable once created.

use std::path::{Path, PathBuf};

use crate::config::TrainerConfig;
use crate::error::{ConfigError, Result};
use crate::persistence;

/// One training run: name, output directories, epoch budget, save cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    name: String,
    save_dir: PathBuf,
    checkpoint_dir: PathBuf,
    epochs: usize,
    save_freq: usize,
}

impl Session {
    /// Create a session rooted at `save_dir`, creating the `checkpoints` and
    /// `logs` subdirectories.
    ///
    /// `training` selects between the configured epoch budget and the single
    /// pass used by evaluation-only sessions.
    pub fn create(
        name: &str,
        save_dir: impl Into<PathBuf>,
        config: &TrainerConfig,
        training: bool,
    ) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "session name must not be empty").into());
        }
        if training && config.epochs.unwrap_or(0) == 0 {
            return Err(ConfigError::invalid("epochs", "bad trainer config epoch count").into());
        }
        if config.save_freq == 0 {
            return Err(ConfigError::invalid("save_freq", "save frequency must be at least 1").into());
        }
        let save_dir = save_dir.into();
        let checkpoint_dir = save_dir.join("checkpoints");
        std::fs::create_dir_all(&checkpoint_dir)?;
        std::fs::create_dir_all(save_dir.join("logs"))?;
        Ok(Self {
            name: name.to_string(),
            save_dir,
            checkpoint_dir,
            epochs: config.epoch_count(training),
            save_freq: config.save_freq,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn log_dir(&self) -> PathBuf {
        self.save_dir.join("logs")
    }

    /// Root of the per-phase summary writers.
    pub fn tbx_root(&self) -> PathBuf {
        self.save_dir.join("tbx_logs").join(&self.name)
    }

    pub fn epochs(&self) -> usize {
        self.epochs
    }

    pub fn save_freq(&self) -> usize {
        self.save_freq
    }

    pub fn config_backup_path(&self) -> PathBuf {
        self.save_dir.join("config.json")
    }

    /// Persist the full session document next to the checkpoints.
    pub fn write_config_backup(&self, raw: &serde_json::Value) -> Result<()> {
        persistence::atomic_write_json(&self.config_backup_path(), raw)?;
        Ok(())
    }

    /// Read the configuration backup, if one was written.
    pub fn read_config_backup(&self) -> Result<Option<serde_json::Value>> {
        Ok(persistence::load_json(&self.config_backup_path())?)
    }
}
