//! Best-effort summary sinks.
//!
//! Each phase gets its own JSON-lines event file under
//! `<save_dir>/tbx_logs/<session>/<phase>-<host>-<timestamp>/events.jsonl`.
//! Open and write failures are logged and swallowed: telemetry never aborts
//! a run.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::components::{MetricSet, RgbImage};
use crate::executor::Phase;
use vigil_core::{ConfigError, Result};

/// Name of the event file inside each writer directory.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Receives scalar, text and image summaries.
pub trait SummaryWriter {
    /// Directory holding this writer's files.
    fn dir(&self) -> &Path;

    /// Tag prefix, the phase name.
    fn prefix(&self) -> &str;

    fn add_scalar(&mut self, tag: &str, value: f64, step: u64);

    fn add_text(&mut self, tag: &str, text: &str, step: u64);

    fn add_image(&mut self, tag: &str, image: &RgbImage, step: u64);
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum EventBody<'a> {
    Scalar { value: f64 },
    Text { text: &'a str },
    Image { width: usize, height: usize },
}

#[derive(Serialize)]
struct Event<'a> {
    wall_time: String,
    step: u64,
    tag: &'a str,
    #[serde(flatten)]
    body: EventBody<'a>,
}

/// JSON-lines summary writer.
#[derive(Debug)]
pub struct JsonlSummaryWriter {
    dir: PathBuf,
    prefix: String,
    file: File,
}

impl JsonlSummaryWriter {
    /// Create the writer directory and its event file. The directory must not
    /// exist yet.
    pub fn create(dir: &Path, prefix: &str) -> Result<Self> {
        if dir.exists() {
            return Err(ConfigError::invalid(
                "use_tbx",
                format!("summary directory '{}' already exists", dir.display()),
            )
            .into());
        }
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            file,
        })
    }

    fn write_event(&mut self, tag: &str, step: u64, body: EventBody<'_>) {
        let event = Event {
            wall_time: Utc::now().to_rfc3339(),
            step,
            tag,
            body,
        };
        let result = serde_json::to_string(&event)
            .map_err(io::Error::other)
            .and_then(|line| writeln!(self.file, "{line}"));
        if let Err(e) = result {
            warn!(tag, error = %e, "failed to write summary event");
        }
    }
}

impl SummaryWriter for JsonlSummaryWriter {
    fn dir(&self) -> &Path {
        &self.dir
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) {
        self.write_event(tag, step, EventBody::Scalar { value });
    }

    fn add_text(&mut self, tag: &str, text: &str, step: u64) {
        self.write_event(tag, step, EventBody::Text { text });
    }

    fn add_image(&mut self, tag: &str, image: &RgbImage, step: u64) {
        self.write_event(
            tag,
            step,
            EventBody::Image {
                width: image.width,
                height: image.height,
            },
        );
    }
}

/// Lazily opened writers for the three phases.
///
/// A writer that cannot be opened is disabled for the rest of the session
/// after a warning; the run continues without that phase's telemetry.
#[derive(Debug)]
pub struct PhaseWriters {
    enabled: bool,
    root: PathBuf,
    suffix: String,
    train: Option<JsonlSummaryWriter>,
    valid: Option<JsonlSummaryWriter>,
    test: Option<JsonlSummaryWriter>,
    failed: BTreeSet<Phase>,
}

impl PhaseWriters {
    /// Writers rooted at `root`; directory names end in `-<host>-<time>`.
    pub fn new(enabled: bool, root: PathBuf, host: &str, time: &str) -> Self {
        Self {
            enabled,
            root,
            suffix: format!("{host}-{time}"),
            train: None,
            valid: None,
            test: None,
            failed: BTreeSet::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, PathBuf::new(), "", "")
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Directory the writer of `phase` uses.
    pub fn path_for(&self, phase: Phase) -> PathBuf {
        self.root.join(format!("{phase}-{}", self.suffix))
    }

    /// Reject writer directories left behind by another run with the same
    /// host and timestamp.
    pub fn check_fresh(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        for phase in Phase::ALL {
            let path = self.path_for(phase);
            if path.exists() {
                return Err(ConfigError::invalid(
                    "use_tbx",
                    format!("summary directory '{}' already exists", path.display()),
                )
                .into());
            }
        }
        Ok(())
    }

    /// Writer for `phase`, opening it on first use. `None` when telemetry is
    /// disabled or the writer could not be opened.
    pub fn get(&mut self, phase: Phase) -> Option<&mut dyn SummaryWriter> {
        if !self.enabled || self.failed.contains(&phase) {
            return None;
        }
        let path = self.path_for(phase);
        let slot = match phase {
            Phase::Train => &mut self.train,
            Phase::Valid => &mut self.valid,
            Phase::Test => &mut self.test,
        };
        if slot.is_none() {
            match JsonlSummaryWriter::create(&path, phase.as_str()) {
                Ok(writer) => *slot = Some(writer),
                Err(e) => {
                    warn!(%phase, error = %e, "cannot open summary writer, telemetry disabled");
                    self.failed.insert(phase);
                    return None;
                }
            }
        }
        slot.as_mut().map(|w| w as &mut dyn SummaryWriter)
    }
}

/// Write end-of-epoch metric summaries: scalars under `epoch/<name>`, plus
/// text and image renderings of visualizable metrics with raw file backups
/// (`<prefix>-<name>-<epoch>.txt` / `.ppm`) next to the event file.
pub fn write_epoch_metrics(writer: &mut dyn SummaryWriter, metrics: &MetricSet, epoch: usize) {
    let step = epoch as u64;
    for (name, metric) in metrics.iter() {
        if metric.is_scalar() {
            if let Some(value) = metric.eval().as_scalar() {
                writer.add_scalar(&format!("epoch/{name}"), value, step);
            }
        }
        let Some(vis) = metric.as_visualizable() else {
            continue;
        };
        let tag = format!("{}/{name}", writer.prefix());
        let stem = format!("{}-{name}-{epoch:04}", writer.prefix());
        if let Some(image) = vis.render_image() {
            writer.add_image(&tag, &image, step);
            backup(&writer.dir().join(format!("{stem}.ppm")), &image.to_ppm());
        }
        if let Some(text) = vis.render_text().filter(|t| !t.is_empty()) {
            writer.add_text(&tag, &text, step);
            backup(&writer.dir().join(format!("{stem}.txt")), text.as_bytes());
        }
    }
}

fn backup(path: &Path, bytes: &[u8]) {
    if let Err(e) = std::fs::write(path, bytes) {
        warn!(path = %path.display(), error = %e, "failed to write raw summary backup");
    }
}
