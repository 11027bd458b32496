//! Best-effort single-writer lock per project.
//!
//! Concurrent indexing runs on the same project would race on the cache,
//! metadata, and collection, so the controller takes a lock file in the
//! project's `.context` directory before writing anything. The lock
//! records pid and acquisition time; locks older than an hour are
//! presumed dead and reclaimed.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Lock file name inside `.context`.
pub const LOCK_FILE: &str = ".index.lock";

/// Locks older than this are considered stale and reclaimed.
const STALE_AFTER_SECS: i64 = 3600;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("another indexing run holds the lock (pid {pid}, acquired {acquired_at})")]
    Held { pid: u32, acquired_at: i64 },

    #[error("failed to take lock: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct LockDocument {
    pid: u32,
    /// Epoch seconds.
    acquired_at: i64,
}

/// Held lock; removed on drop.
#[derive(Debug)]
pub struct ProjectLock {
    path: PathBuf,
}

impl ProjectLock {
    /// Acquire the lock inside `context_dir`, reclaiming a stale one.
    pub fn acquire(context_dir: &Path) -> Result<Self, LockError> {
        fs::create_dir_all(context_dir)?;
        let path = context_dir.join(LOCK_FILE);

        if let Ok(text) = fs::read_to_string(&path) {
            match serde_json::from_str::<LockDocument>(&text) {
                Ok(doc) => {
                    let age = Utc::now().timestamp() - doc.acquired_at;
                    if age < STALE_AFTER_SECS {
                        return Err(LockError::Held {
                            pid: doc.pid,
                            acquired_at: doc.acquired_at,
                        });
                    }
                    warn!(pid = doc.pid, age_secs = age, "reclaiming stale lock");
                }
                Err(_) => warn!("reclaiming unparseable lock file"),
            }
            let _ = fs::remove_file(&path);
        }

        let doc = LockDocument {
            pid: std::process::id(),
            acquired_at: Utc::now().timestamp(),
        };
        let payload = serde_json::to_vec(&doc).map_err(std::io::Error::from)?;
        fs::write(&path, payload)?;
        debug!(path = %path.display(), "lock acquired");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to release lock: {err}");
            }
        }
    }
}
