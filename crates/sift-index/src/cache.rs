//! Per-file content hash cache.
//!
//! Tracks what has been indexed so subsequent runs only touch changed
//! files. One JSON document per project, stored in the project-local
//! `.context` directory and bound to a collection name: a cache written
//! for a different collection is treated as empty.
//!
//! Saves are atomic (write to a temp file, then rename) so a crash cannot
//! leave a truncated document behind.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Project-local directory holding the cache, metadata, and lock file.
pub const CONTEXT_DIR: &str = ".context";

/// Cache document file name inside [`CONTEXT_DIR`].
pub const CACHE_FILE: &str = "file-hashes.json";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to read cache: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write cache: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to parse cache: {0}")]
    Parse(#[source] serde_json::Error),
}

/// State of one indexed file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileHashEntry {
    /// SHA-256 of the file's raw bytes, lowercase hex.
    pub content_hash: String,
    /// Last-modified time observed at indexing, epoch milliseconds.
    pub last_modified: i64,
    /// Chunks currently stored in the collection for this file.
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheDocument {
    project_path: String,
    collection_name: String,
    last_indexed: Option<DateTime<Utc>>,
    /// Keyed by repository-relative, forward-slash-normalized path.
    files: BTreeMap<String, FileHashEntry>,
}

/// In-memory cache handle bound to its on-disk document.
#[derive(Debug)]
pub struct HashCache {
    path: PathBuf,
    doc: CacheDocument,
    /// True when an on-disk document existed but was written for a
    /// different collection.
    stale: bool,
}

impl HashCache {
    /// Load the cache for `(project_root, collection_name)`, or start
    /// empty when the document is missing, unreadable, or was written for
    /// a different collection.
    pub fn load(project_root: &Path, collection_name: &str) -> Self {
        let path = project_root.join(CONTEXT_DIR).join(CACHE_FILE);
        let empty = CacheDocument {
            project_path: project_root.to_string_lossy().into_owned(),
            collection_name: collection_name.to_string(),
            last_indexed: None,
            files: BTreeMap::new(),
        };

        let mut stale = false;
        let doc = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<CacheDocument>(&text) {
                Ok(doc) if doc.collection_name == collection_name => doc,
                Ok(doc) => {
                    debug!(
                        cached = %doc.collection_name,
                        current = %collection_name,
                        "cache belongs to a different collection, starting empty"
                    );
                    stale = true;
                    empty
                }
                Err(err) => {
                    warn!("unparseable cache document, starting empty: {err}");
                    empty
                }
            },
            Err(_) => empty,
        };

        Self { path, doc, stale }
    }

    /// True when the loaded document belonged to a different collection;
    /// the controller treats the run as a full index in that case.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// True if the path is not cached or its stored hash differs.
    pub fn has_file_changed(&self, relative_path: &str, current_hash: &str) -> bool {
        match self.doc.files.get(relative_path) {
            Some(entry) => entry.content_hash != current_hash,
            None => true,
        }
    }

    /// Record or overwrite a file entry.
    pub fn update_file(
        &mut self,
        relative_path: &str,
        content_hash: String,
        last_modified: i64,
        chunk_count: usize,
    ) {
        self.doc.files.insert(
            relative_path.to_string(),
            FileHashEntry {
                content_hash,
                last_modified,
                chunk_count,
            },
        );
    }

    /// Drop a file entry, returning it if present.
    pub fn remove_file(&mut self, relative_path: &str) -> Option<FileHashEntry> {
        self.doc.files.remove(relative_path)
    }

    /// Cached paths that are no longer in the working tree.
    pub fn deleted_files(&self, current_files: &HashSet<String>) -> Vec<String> {
        self.doc
            .files
            .keys()
            .filter(|path| !current_files.contains(*path))
            .cloned()
            .collect()
    }

    pub fn get(&self, relative_path: &str) -> Option<&FileHashEntry> {
        self.doc.files.get(relative_path)
    }

    pub fn len(&self) -> usize {
        self.doc.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.files.is_empty()
    }

    /// Sum of chunk counts across all cached files.
    pub fn total_chunks(&self) -> usize {
        self.doc.files.values().map(|e| e.chunk_count).sum()
    }

    /// Persist atomically, stamping `last_indexed`.
    pub fn save(&mut self) -> Result<(), CacheError> {
        self.doc.last_indexed = Some(Utc::now());
        let json = serde_json::to_string_pretty(&self.doc).map_err(CacheError::Parse)?;
        write_atomic(&self.path, json.as_bytes()).map_err(CacheError::Write)
    }

    /// Delete the backing document and reset in-memory state.
    pub fn clear(&mut self) -> Result<(), CacheError> {
        self.doc.files.clear();
        self.doc.last_indexed = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CacheError::Write(err)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn collection_name(&self) -> &str {
        &self.doc.collection_name
    }
}

/// Write `bytes` to `path` via a temp file in the same directory followed
/// by a rename, so readers only ever observe a complete document.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string()),
        std::process::id()
    ));

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            Err(err)
        }
    }
}
