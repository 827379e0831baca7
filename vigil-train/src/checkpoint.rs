//! Durable training checkpoints.
//!
//! Every save writes a timestamped, host-qualified record
//! (`ckpt.<epoch:04>.<host>.<time>.json`); best saves also replace
//! `ckpt.best.json`. Both are written to a temporary file first and renamed
//! into place, so a partially written record is never visible. Records are
//! never deleted by the store.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::model::{StateDict, TaskDescriptor};
use crate::outputs::{EpochOutputs, OutputHistory};
use vigil_core::persistence::{atomic_write_json, json_fingerprint, read_json};
use vigil_core::{CheckpointError, Result};

pub const BEST_FILE_NAME: &str = "ckpt.best.json";
pub const TIME_FORMAT: &str = "%Y%m%d-%H%M%S";

const PREFIX: &str = "ckpt.";
const EXTENSION: &str = "json";

/// Name of the machine writing checkpoints.
///
/// Read from `HOSTNAME`, then `HOST`. Interactive shells often set
/// `HOSTNAME` without exporting it, in which case records are named with
/// `unknown`; export it to get host-qualified file names.
pub fn host() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Current local time in checkpoint file-name format.
pub fn timestamp() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

/// Self-describing snapshot of a training session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub name: String,
    pub epoch: usize,
    pub iter: u64,
    pub time: String,
    pub host: String,
    pub task: TaskDescriptor,
    /// Outputs of the saved epoch.
    pub outputs: EpochOutputs,
    /// Every epoch recorded so far, for resuming.
    #[serde(default)]
    pub history: OutputHistory,
    pub model_state: StateDict,
    #[serde(default)]
    pub optimizer_state: Option<serde_json::Value>,
    #[serde(default)]
    pub monitor_best: Option<f64>,
    /// Session configuration backup at save time.
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

impl CheckpointRecord {
    /// File name of the regular record for this snapshot.
    pub fn file_name(&self) -> String {
        format!(
            "{PREFIX}{:04}.{}.{}.{EXTENSION}",
            self.epoch, self.host, self.time
        )
    }

    /// Fingerprint of the stored model architecture section.
    pub fn model_fingerprint(&self) -> Option<String> {
        self.config
            .as_ref()
            .and_then(|c| c.get("model"))
            .map(json_fingerprint)
    }
}

/// Reads and writes checkpoint records in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_FILE_NAME)
    }

    /// Write the regular record, and the best record when `is_best`.
    /// Returns the regular record's path.
    pub fn save(&self, record: &CheckpointRecord, is_best: bool) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).map_err(|e| CheckpointError::WriteFailed {
            path: self.dir.clone(),
            message: e.to_string(),
        })?;
        let path = self.dir.join(record.file_name());
        write_record(&path, record)?;
        if is_best {
            write_record(&self.best_path(), record)?;
            info!("saving new best checkpoint @ epoch {}", record.epoch);
        } else {
            info!("saving checkpoint @ epoch {}", record.epoch);
        }
        Ok(path)
    }

    /// Read a record. A missing or unparsable file is an error.
    pub fn load(&self, path: &Path) -> Result<CheckpointRecord> {
        load_record(path)
    }

    pub fn load_best(&self) -> Result<CheckpointRecord> {
        load_record(&self.best_path())
    }

    /// Regular records, oldest epoch first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut records: Vec<(usize, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(epoch) = parse_epoch(name) {
                records.push((epoch, path));
            }
        }
        records.sort();
        Ok(records.into_iter().map(|(_, path)| path).collect())
    }

    /// Most recent regular record, if any.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.list()?.pop())
    }

    /// Check that `record` was produced for the architecture described by the
    /// session configuration backup. Without a backup there is nothing to
    /// compare against and the check passes. A `model` section absent from both
    /// sides counts as the same architecture.
    pub fn verify_compatible(
        &self,
        record: &CheckpointRecord,
        path: &Path,
        backup: Option<&serde_json::Value>,
    ) -> Result<()> {
        let Some(backup) = backup else {
            debug!("no configuration backup, skipping checkpoint compatibility check");
            return Ok(());
        };
        let expected = backup.get("model").map(json_fingerprint);
        let stored = record.model_fingerprint();
        if expected != stored {
            return Err(CheckpointError::Incompatible {
                path: path.to_path_buf(),
                message: "stored model configuration does not match the session configuration backup"
                    .to_string(),
            }
            .into());
        }
        Ok(())
    }
}

fn write_record(path: &Path, record: &CheckpointRecord) -> Result<()> {
    atomic_write_json(path, record).map_err(|e| {
        CheckpointError::WriteFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
        .into()
    })
}

fn load_record(path: &Path) -> Result<CheckpointRecord> {
    if !path.is_file() {
        return Err(CheckpointError::NotFound {
            path: path.to_path_buf(),
        }
        .into());
    }
    read_json(path).map_err(|e| {
        CheckpointError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
        .into()
    })
}

/// Epoch of a regular record file name, `None` for anything else.
fn parse_epoch(file_name: &str) -> Option<usize> {
    let rest = file_name.strip_prefix(PREFIX)?;
    let rest = rest.strip_suffix(&format!(".{EXTENSION}"))?;
    let (epoch, _) = rest.split_once('.')?;
    if epoch.len() < 4 {
        return None;
    }
    epoch.parse().ok()
}
