//! Per-run JSONL event log.
//!
//! Every indexing run appends structured events to its own file under the
//! user's home directory (never inside the indexed project), one JSON
//! object per line:
//!
//! ```text
//! {"timestamp":"2026-08-02T09:15:00Z","level":"info","project":"widgets","message":"run started"}
//! ```
//!
//! Old log files are pruned on demand; retention is seven days.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::warn;

/// Log directory under the user's home.
pub const LOG_DIR: &str = ".context/logs";

/// Files older than this are removed by [`IndexLogger::prune`].
pub const RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Append-only JSONL logger for one indexing run.
pub struct IndexLogger {
    file: Mutex<File>,
    project: String,
    path: PathBuf,
}

impl IndexLogger {
    /// Create a run log under `<home>/.context/logs`.
    pub fn create(project_root: &Path) -> std::io::Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "home directory unavailable")
        })?;
        Self::create_in(&home.join(LOG_DIR), project_root)
    }

    /// Create a run log inside an explicit directory (used by tests).
    pub fn create_in(logs_dir: &Path, project_root: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(logs_dir)?;

        let project = project_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        // Colons are not portable in file names; keep the rest ISO-8601.
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let path = logs_dir.join(format!("index-{project}-{stamp}.log"));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            project,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, level: LogLevel, message: &str, data: Option<serde_json::Value>) {
        let mut event = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level.as_str(),
            "project": self.project,
            "message": message,
        });
        if let Some(data) = data {
            event["data"] = data;
        }

        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writeln!(file, "{event}") {
            warn!("failed to append run log: {err}");
        }
    }

    pub fn info(&self, message: &str, data: Option<serde_json::Value>) {
        self.log(LogLevel::Info, message, data);
    }

    pub fn warn(&self, message: &str, data: Option<serde_json::Value>) {
        self.log(LogLevel::Warn, message, data);
    }

    pub fn error(&self, message: &str, data: Option<serde_json::Value>) {
        self.log(LogLevel::Error, message, data);
    }

    /// Remove log files older than [`RETENTION`]. Returns how many were
    /// removed. Missing directory counts as nothing to prune.
    pub fn prune(logs_dir: &Path) -> std::io::Result<usize> {
        let entries = match fs::read_dir(logs_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_log = path
                .extension()
                .map(|e| e == "log")
                .unwrap_or(false);
            if !is_log {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok());
            if let Some(age) = age {
                if age > RETENTION && fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
