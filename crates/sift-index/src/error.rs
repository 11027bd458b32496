//! Controller-boundary error type.
//!
//! Subsystems keep their own error enums; this is what an indexing run
//! surfaces to the caller. Per-file failures are not errors at this level:
//! they are aggregated into the run summary and retried on the next run.

use thiserror::Error;

use crate::cache::CacheError;
use crate::chunker::ChunkerError;
use crate::embeddings::EmbeddingError;
use crate::lock::LockError;
use crate::metadata::MetadataError;
use crate::store::StoreError;
use crate::walker::WalkerError;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("another run is already indexing this project: {0}")]
    Locked(#[from] LockError),

    #[error(transparent)]
    Walker(#[from] WalkerError),

    #[error(transparent)]
    Chunker(#[from] ChunkerError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to persist hash cache: {0}")]
    CacheWrite(#[from] CacheError),

    #[error("failed to persist project metadata: {0}")]
    MetadataWrite(#[from] MetadataError),
}

impl IndexError {
    /// The dimension-mismatch message shown when the configured embedding
    /// model no longer matches the existing collection.
    pub fn dimension_mismatch(collection: &str, existing: usize, configured: usize) -> Self {
        Self::Configuration(format!(
            "collection '{collection}' was created with dimension {existing} but the \
             embedding client produces {configured}; run with --clean to rebuild"
        ))
    }
}
