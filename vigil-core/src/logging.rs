//! Session-scoped logging.
//!
//! Each session owns a [`SessionLog`]: a `tracing` dispatcher that writes
//! human-readable lines to stderr and a plain-text copy to
//! `<save_dir>/logs/train.log`. The dispatcher is only installed while a
//! [`SessionScope`] is alive, so several sessions in one process keep separate
//! log files and nothing global is mutated.

use std::io;
use std::path::{Path, PathBuf};

use tracing::Dispatch;
use tracing::dispatcher::DefaultGuard;
use tracing::span::EnteredSpan;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// File name of the per-session training log.
pub const LOG_FILE_NAME: &str = "train.log";

/// Logger handle scoped to one session's lifetime.
pub struct SessionLog {
    name: String,
    path: PathBuf,
    dispatch: Dispatch,
    // Flushes the non-blocking file writer on drop.
    _guard: WorkerGuard,
}

impl SessionLog {
    /// Log to stderr (filtered by `RUST_LOG`, `info` by default) and to the
    /// session log file (always at `debug`).
    pub fn create(log_dir: &Path, session_name: &str) -> io::Result<Self> {
        Self::build(log_dir, session_name, true)
    }

    /// Log to the session file only.
    pub fn file_only(log_dir: &Path, session_name: &str) -> io::Result<Self> {
        Self::build(log_dir, session_name, false)
    }

    fn build(log_dir: &Path, session_name: &str, echo_stderr: bool) -> io::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let appender = tracing_appender::rolling::never(log_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
            .with_filter(EnvFilter::new("debug"));

        let stderr_layer = echo_stderr.then(|| {
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
        });

        let subscriber = Registry::default().with(file_layer).with(stderr_layer);

        Ok(Self {
            name: session_name.to_string(),
            path: log_dir.join(LOG_FILE_NAME),
            dispatch: Dispatch::new(subscriber),
            _guard: guard,
        })
    }

    /// Path of the session log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Install this session's dispatcher on the current thread and enter a
    /// `session` span. Both are removed when the returned scope is dropped.
    pub fn enter(&self) -> SessionScope {
        let default = tracing::dispatcher::set_default(&self.dispatch);
        let span = tracing::info_span!("session", name = %self.name).entered();
        SessionScope {
            _span: span,
            _default: default,
        }
    }
}

impl std::fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLog")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

/// Active logging scope of a session. Field order matters: the span is
/// exited before the dispatcher is uninstalled.
pub struct SessionScope {
    _span: EnteredSpan,
    _default: DefaultGuard,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_session_log_writes_file() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("logs");
        {
            let log = SessionLog::file_only(&log_dir, "unit").unwrap();
            let _scope = log.enter();
            tracing::info!("created training log for session 'unit'");
        }
        let content = std::fs::read_to_string(log_dir.join(LOG_FILE_NAME)).unwrap();
        assert!(content.contains("created training log for session 'unit'"));
        assert!(content.contains("session"));
    }

    #[test]
    fn test_events_outside_scope_are_not_captured() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("logs");
        {
            let log = SessionLog::file_only(&log_dir, "scoped").unwrap();
            tracing::info!("before scope");
            {
                let _scope = log.enter();
                tracing::info!("inside scope");
            }
            tracing::info!("after scope");
        }
        let content = std::fs::read_to_string(log_dir.join(LOG_FILE_NAME)).unwrap();
        assert!(content.contains("inside scope"));
        assert!(!content.contains("before scope"));
        assert!(!content.contains("after scope"));
    }
}
