//! Vector store abstraction.
//!
//! The engine talks to its vector database through the [`VectorStore`]
//! trait so the controller and search engine stay backend-agnostic. Two
//! implementations ship with the crate: [`memory::MemoryStore`] for tests
//! and offline use, and [`qdrant::QdrantStore`] for the remote database.
//!
//! Collections store one dense vector per chunk under the named vector
//! [`DENSE_VECTOR_FIELD`]; hybrid collections additionally store a lexical
//! sparse vector under [`SPARSE_VECTOR_FIELD`].

pub mod memory;
pub mod qdrant;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::filter::FilterExpr;
use crate::retry::Recoverable;
use crate::sparse::SparseVector;

/// Named dense vector field.
pub const DENSE_VECTOR_FIELD: &str = "vector";

/// Named sparse vector field (hybrid collections only).
pub const SPARSE_VECTOR_FIELD: &str = "sparse_vector";

/// Reciprocal rank fusion constant. Chosen to match operational data;
/// treat a change as a behavioral break.
pub const RRF_K: f64 = 100.0;

/// Verification passes when at least this share of expected rows is
/// observed after a write.
pub const VERIFY_THRESHOLD: f64 = 0.8;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("collection '{0}' does not exist")]
    MissingCollection(String),

    #[error("collection '{name}' has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("collection '{name}' hybrid flag is {actual}, expected {expected}")]
    HybridMismatch {
        name: String,
        expected: bool,
        actual: bool,
    },

    #[error("vector store call timed out: {0}")]
    Timeout(String),

    #[error("vector store connection error: {0}")]
    Connection(String),

    #[error("vector store error: {0}")]
    Api(String),

    #[error("all search sub-requests failed: {0}")]
    AllSubRequestsFailed(String),
}

impl Recoverable for StoreError {
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connection(_))
    }
}

/// Declared shape of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSchema {
    pub dimension: usize,
    pub hybrid: bool,
}

/// One row to insert: a chunk plus its dense vector, and optionally the
/// lexical sparse vector (computed from `content` if absent on the
/// hybrid path).
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub dense_vector: Vec<f32>,
    pub content: String,
    pub relative_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub file_extension: String,
    pub metadata: serde_json::Value,
    pub sparse_vector: Option<SparseVector>,
}

/// A chunk as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub id: String,
    pub content: String,
    pub relative_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub file_extension: String,
    pub metadata: serde_json::Value,
}

/// A stored chunk with a retrieval score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: StoredChunk,
    pub score: f64,
}

/// One ranked sub-query of a hybrid search.
#[derive(Debug, Clone)]
pub enum SubRequest {
    /// Nearest-neighbor search over the dense field.
    Dense {
        vector: Vec<f32>,
        limit: usize,
        nprobe: u32,
    },
    /// Lexical search over the sparse field; the store encodes the query
    /// text into the sparse space.
    Sparse {
        text: String,
        limit: usize,
        drop_ratio: f32,
    },
}

/// Options applied after the sub-requests run.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    /// RRF constant for rank fusion.
    pub rrf_k: f64,
    /// Post-filter applied to the fused list.
    pub filter: Option<FilterExpr>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            rrf_k: RRF_K,
            filter: None,
        }
    }
}

/// Post-write row count check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    pub expected: usize,
    pub observed: usize,
}

impl Verification {
    /// False when the observed count fell below the warning threshold.
    /// A failed verification is a warning, never an error.
    pub fn is_complete(&self) -> bool {
        self.observed as f64 >= self.expected as f64 * VERIFY_THRESHOLD
    }
}

/// Remote vector database capability surface. All operations may block on
/// network I/O; implementations are safe to share across tasks.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    async fn has_collection(&self, name: &str) -> Result<bool, StoreError>;

    /// Declared schema of a collection, `None` when it does not exist.
    async fn describe_collection(
        &self,
        name: &str,
    ) -> Result<Option<CollectionSchema>, StoreError>;

    /// Create a collection. Succeeds if it already exists with the same
    /// dimension and hybrid flag; fails otherwise.
    async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        hybrid: bool,
    ) -> Result<(), StoreError>;

    /// Drop a collection; absent collections are fine.
    async fn drop_collection(&self, name: &str) -> Result<(), StoreError>;

    /// Dense-only insert.
    async fn insert(&self, name: &str, rows: Vec<ChunkRecord>) -> Result<(), StoreError>;

    /// Dense + sparse insert. Rows without a sparse vector get one
    /// computed from their content.
    async fn insert_hybrid(&self, name: &str, rows: Vec<ChunkRecord>)
        -> Result<(), StoreError>;

    /// Non-vector query by filter. A missing collection yields an empty
    /// result, not an error.
    async fn query(
        &self,
        name: &str,
        filter: &FilterExpr,
        limit: usize,
    ) -> Result<Vec<StoredChunk>, StoreError>;

    /// Delete every row matching the filter. Returns the number removed
    /// when the backend reports it.
    async fn delete_by_filter(
        &self,
        name: &str,
        filter: &FilterExpr,
    ) -> Result<(), StoreError>;

    /// Run the sub-requests, fuse their rankings with RRF, post-filter,
    /// and return the top `options.limit` documents.
    async fn hybrid_search(
        &self,
        name: &str,
        requests: Vec<SubRequest>,
        options: &SearchOptions,
    ) -> Result<Vec<ScoredChunk>, StoreError>;

    async fn count(&self, name: &str) -> Result<usize, StoreError>;

    /// Wait for writes to settle, then re-count and compare against
    /// `expected`.
    async fn verify_inserted(
        &self,
        name: &str,
        expected: usize,
    ) -> Result<Verification, StoreError>;
}

/// Reciprocal rank fusion over ranked id lists.
///
/// Each document accumulates `1 / (k + rank)` per list it appears in,
/// ranks 1-based. The fused list is ordered by score descending with ties
/// broken by id ascending, which keeps results stable across runs.
pub fn rrf_fuse(rankings: &[Vec<String>], k: f64) -> Vec<(String, f64)> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    for ranking in rankings {
        for (rank0, id) in ranking.iter().enumerate() {
            *scores.entry(id.clone()).or_default() += 1.0 / (k + (rank0 + 1) as f64);
        }
    }

    let mut fused: Vec<(String, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    fused
}

/// Shared tail of every `hybrid_search` implementation: fuse, post-filter,
/// truncate.
pub(crate) fn fuse_and_rank(
    rankings: &[Vec<String>],
    chunks_by_id: HashMap<String, StoredChunk>,
    options: &SearchOptions,
) -> Vec<ScoredChunk> {
    let mut chunks_by_id = chunks_by_id;
    rrf_fuse(rankings, options.rrf_k)
        .into_iter()
        .filter_map(|(id, score)| {
            let chunk = chunks_by_id.remove(&id)?;
            if let Some(filter) = &options.filter {
                if !filter.matches(&chunk) {
                    return None;
                }
            }
            Some(ScoredChunk { chunk, score })
        })
        .take(options.limit)
        .collect()
}
