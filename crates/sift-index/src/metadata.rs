//! Per-project metadata document.
//!
//! One record per project, written to `.context/project.json` and intended
//! to be committed, so everyone who indexes the project converges on the
//! same collection name, embedding model, and dimension.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{write_atomic, CONTEXT_DIR};

/// Metadata document file name inside `.context`.
pub const METADATA_FILE: &str = "project.json";

/// Current document format version.
pub const METADATA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("failed to read project metadata: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write project metadata: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to parse project metadata: {0}")]
    Parse(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetadata {
    pub version: u32,
    pub project_path: String,
    pub collection_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_repo_identifier: Option<String>,
    pub is_hybrid: bool,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub created_at: DateTime<Utc>,
    pub last_indexed: Option<DateTime<Utc>>,
    pub indexed_file_count: usize,
    pub total_chunks: usize,
}

impl ProjectMetadata {
    pub fn new(
        project_path: &Path,
        collection_name: String,
        git_repo_identifier: Option<String>,
        is_hybrid: bool,
        embedding_model: String,
        embedding_dimension: usize,
    ) -> Self {
        Self {
            version: METADATA_VERSION,
            project_path: project_path.to_string_lossy().into_owned(),
            collection_name,
            git_repo_identifier,
            is_hybrid,
            embedding_model,
            embedding_dimension,
            created_at: Utc::now(),
            last_indexed: None,
            indexed_file_count: 0,
            total_chunks: 0,
        }
    }

    pub fn file_path(project_root: &Path) -> PathBuf {
        project_root.join(CONTEXT_DIR).join(METADATA_FILE)
    }

    /// Load the metadata document if present and parseable.
    pub fn load(project_root: &Path) -> Result<Option<Self>, MetadataError> {
        let path = Self::file_path(project_root);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(MetadataError::Read(err)),
        };
        serde_json::from_str(&text).map(Some).map_err(MetadataError::Parse)
    }

    /// Persist atomically as pretty-printed JSON.
    pub fn save(&self, project_root: &Path) -> Result<(), MetadataError> {
        let json = serde_json::to_string_pretty(self).map_err(MetadataError::Parse)?;
        write_atomic(&Self::file_path(project_root), json.as_bytes())
            .map_err(MetadataError::Write)
    }

    /// Delete the document, tolerating its absence.
    pub fn delete(project_root: &Path) -> Result<(), MetadataError> {
        match fs::remove_file(Self::file_path(project_root)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MetadataError::Write(err)),
        }
    }
}
