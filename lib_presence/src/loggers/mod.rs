//! # Logging Setup
//!
//! Installs the global `tracing` subscriber for binaries built on this crate:
//!
//! - **stdout**: human-readable or JSON lines.
//! - **file** (optional): a non-blocking writer into `<log_dir>/<app>_<timestamp>.log`.
//!   Older log files of the same app are deleted first, keeping only the most
//!   recent one next to the new file.
//!
//! The level comes from `RUST_LOG` when set, else from `LogOptions::level`.

use std::cmp::Reverse;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Errors while installing the subscriber.
#[derive(Debug, Error)]
pub enum LogSetupError {
    /// The log directory could not be prepared.
    #[error("I/O error occurred: {0}")]
    Io(#[from] io::Error),

    /// The level string is not a valid filter directive.
    #[error("Invalid log filter: {0}")]
    Filter(String),

    /// A global subscriber is already installed.
    #[error("Failed to install subscriber: {0}")]
    Init(String),
}

/// Where and how to log.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Prefix of the log file name.
    pub app_name: String,
    /// Fallback filter directive (`info`, `lib_presence=debug`, ...).
    pub level: String,
    /// Directory for the log file. `None` logs to stdout only.
    pub log_dir: Option<PathBuf>,
    /// JSON lines on stdout instead of the compact text format.
    pub json: bool,
}

impl LogOptions {
    /// Stdout-only text logging at `info`.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            level: "info".to_string(),
            log_dir: None,
            json: false,
        }
    }
}

/// Name of a fresh log file for `app_name`.
pub fn log_file_name(app_name: &str) -> String {
    format!("{}_{}.log", app_name, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"))
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// lifetime of the process, or buffered file lines are lost.
pub fn init_tracing(options: &LogOptions) -> Result<Option<WorkerGuard>, LogSetupError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.level))
        .map_err(|e| LogSetupError::Filter(e.to_string()))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if options.json {
        layers.push(fmt::layer().json().with_target(true).boxed());
    } else {
        layers.push(fmt::layer().with_target(true).boxed());
    }

    let mut guard = None;
    if let Some(dir) = &options.log_dir {
        fs::create_dir_all(dir)?;
        cleanup_old_logs(dir, &options.app_name)?;

        let appender = tracing_appender::rolling::never(dir, log_file_name(&options.app_name));
        let (writer, worker) = tracing_appender::non_blocking(appender);
        layers.push(fmt::layer().with_writer(writer).with_ansi(false).boxed());
        guard = Some(worker);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LogSetupError::Init(e.to_string()))?;
    Ok(guard)
}

/// Deletes `app_name`'s log files in `log_dir` except the most recently
/// modified one. Returns how many files were removed.
pub fn cleanup_old_logs(log_dir: &Path, app_name: &str) -> io::Result<usize> {
    let prefix = format!("{}_", app_name);
    let mut entries: Vec<(PathBuf, std::time::SystemTime)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with(&prefix) && name.ends_with(".log")
        })
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((e.path(), modified))
        })
        .collect();

    // Newest first
    entries.sort_by_key(|(_, modified)| Reverse(*modified));

    let mut removed = 0;
    for (path, _) in entries.iter().skip(1) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};

    fn touch(dir: &Path, name: &str, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).expect("create log file");
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .expect("set mtime");
        path
    }

    #[test]
    fn test_cleanup_keeps_newest_of_same_app() {
        let dir = tempfile::tempdir().expect("temp dir");
        let newest = touch(dir.path(), "server_presence_3.log", 10);
        let older = touch(dir.path(), "server_presence_2.log", 100);
        let oldest = touch(dir.path(), "server_presence_1.log", 1_000);
        let other_app = touch(dir.path(), "other_1.log", 5_000);
        let not_a_log = touch(dir.path(), "server_presence_notes.txt", 5_000);

        let removed = cleanup_old_logs(dir.path(), "server_presence").expect("cleanup ok");

        assert_eq!(removed, 2);
        assert!(newest.exists());
        assert!(!older.exists());
        assert!(!oldest.exists());
        assert!(other_app.exists());
        assert!(not_a_log.exists());
    }

    #[test]
    fn test_log_file_name_shape() {
        let name = log_file_name("server_presence");
        assert!(name.starts_with("server_presence_"));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn test_log_options_defaults() {
        let options = LogOptions::new("app");
        assert_eq!(options.level, "info");
        assert!(options.log_dir.is_none());
        assert!(!options.json);
    }
}
