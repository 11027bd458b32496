//! In-memory vector store.
//!
//! Implements the full [`VectorStore`] surface over process-local maps:
//! cosine similarity for the dense field, sparse dot product for the
//! lexical field. The test suite runs against this backend, and it doubles
//! as an offline store for small projects.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::filter::FilterExpr;
use crate::sparse::{self, SparseVector};

use super::{
    fuse_and_rank, ChunkRecord, CollectionSchema, ScoredChunk, SearchOptions, StoreError,
    StoredChunk, SubRequest, Verification, VectorStore,
};

struct MemoryRow {
    chunk: StoredChunk,
    dense: Vec<f32>,
    sparse: Option<SparseVector>,
}

struct MemoryCollection {
    schema: CollectionSchema,
    rows: BTreeMap<String, MemoryRow>,
}

/// Process-local [`VectorStore`].
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_rows(
        schema: CollectionSchema,
        name: &str,
        rows: &[ChunkRecord],
    ) -> Result<(), StoreError> {
        for row in rows {
            if row.dense_vector.len() != schema.dimension {
                return Err(StoreError::DimensionMismatch {
                    name: name.to_string(),
                    expected: schema.dimension,
                    actual: row.dense_vector.len(),
                });
            }
        }
        Ok(())
    }

    async fn insert_rows(
        &self,
        name: &str,
        rows: Vec<ChunkRecord>,
        with_sparse: bool,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| StoreError::MissingCollection(name.to_string()))?;
        Self::check_rows(collection.schema, name, &rows)?;
        if with_sparse && !collection.schema.hybrid {
            return Err(StoreError::HybridMismatch {
                name: name.to_string(),
                expected: true,
                actual: false,
            });
        }

        for row in rows {
            let sparse = if with_sparse {
                Some(
                    row.sparse_vector
                        .clone()
                        .unwrap_or_else(|| sparse::encode_document(&row.content)),
                )
            } else {
                None
            };
            let stored = StoredChunk {
                id: row.id.clone(),
                content: row.content,
                relative_path: row.relative_path,
                start_line: row.start_line,
                end_line: row.end_line,
                file_extension: row.file_extension,
                metadata: row.metadata,
            };
            collection.rows.insert(
                row.id,
                MemoryRow {
                    chunk: stored,
                    dense: row.dense_vector,
                    sparse,
                },
            );
        }
        Ok(())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

fn ranked_ids(mut scored: Vec<(String, f32)>, limit: usize) -> Vec<String> {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(limit);
    scored.into_iter().map(|(id, _)| id).collect()
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let collections = self.collections.read().await;
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn has_collection(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.collections.read().await.contains_key(name))
    }

    async fn describe_collection(
        &self,
        name: &str,
    ) -> Result<Option<CollectionSchema>, StoreError> {
        Ok(self.collections.read().await.get(name).map(|c| c.schema))
    }

    async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        hybrid: bool,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        if let Some(existing) = collections.get(name) {
            if existing.schema.dimension != dimension {
                return Err(StoreError::DimensionMismatch {
                    name: name.to_string(),
                    expected: dimension,
                    actual: existing.schema.dimension,
                });
            }
            if existing.schema.hybrid != hybrid {
                return Err(StoreError::HybridMismatch {
                    name: name.to_string(),
                    expected: hybrid,
                    actual: existing.schema.hybrid,
                });
            }
            return Ok(());
        }

        debug!(collection = name, dimension, hybrid, "creating collection");
        collections.insert(
            name.to_string(),
            MemoryCollection {
                schema: CollectionSchema { dimension, hybrid },
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        self.collections.write().await.remove(name);
        Ok(())
    }

    async fn insert(&self, name: &str, rows: Vec<ChunkRecord>) -> Result<(), StoreError> {
        self.insert_rows(name, rows, false).await
    }

    async fn insert_hybrid(
        &self,
        name: &str,
        rows: Vec<ChunkRecord>,
    ) -> Result<(), StoreError> {
        self.insert_rows(name, rows, true).await
    }

    async fn query(
        &self,
        name: &str,
        filter: &FilterExpr,
        limit: usize,
    ) -> Result<Vec<StoredChunk>, StoreError> {
        let collections = self.collections.read().await;
        let collection = match collections.get(name) {
            Some(c) => c,
            // Not-found on a query is an empty result, not an error.
            None => return Ok(Vec::new()),
        };
        Ok(collection
            .rows
            .values()
            .filter(|row| filter.matches(&row.chunk))
            .take(limit)
            .map(|row| row.chunk.clone())
            .collect())
    }

    async fn delete_by_filter(
        &self,
        name: &str,
        filter: &FilterExpr,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        if let Some(collection) = collections.get_mut(name) {
            collection.rows.retain(|_, row| !filter.matches(&row.chunk));
        }
        Ok(())
    }

    async fn hybrid_search(
        &self,
        name: &str,
        requests: Vec<SubRequest>,
        options: &SearchOptions,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let collections = self.collections.read().await;
        let collection = match collections.get(name) {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };

        let mut rankings = Vec::with_capacity(requests.len());
        let mut chunks_by_id: HashMap<String, StoredChunk> = HashMap::new();

        for request in &requests {
            let ranking = match request {
                SubRequest::Dense { vector, limit, .. } => {
                    let scored: Vec<(String, f32)> = collection
                        .rows
                        .values()
                        .map(|row| (row.chunk.id.clone(), cosine(vector, &row.dense)))
                        .collect();
                    ranked_ids(scored, *limit)
                }
                SubRequest::Sparse {
                    text,
                    limit,
                    drop_ratio,
                } => {
                    let query = sparse::encode_query(text, *drop_ratio);
                    let scored: Vec<(String, f32)> = collection
                        .rows
                        .values()
                        .filter_map(|row| {
                            let doc = row.sparse.as_ref()?;
                            let score = doc.dot(&query);
                            (score > 0.0).then(|| (row.chunk.id.clone(), score))
                        })
                        .collect();
                    ranked_ids(scored, *limit)
                }
            };

            for id in &ranking {
                if let Some(row) = collection.rows.get(id) {
                    chunks_by_id.insert(id.clone(), row.chunk.clone());
                }
            }
            rankings.push(ranking);
        }

        Ok(fuse_and_rank(&rankings, chunks_by_id, options))
    }

    async fn count(&self, name: &str) -> Result<usize, StoreError> {
        Ok(self
            .collections
            .read()
            .await
            .get(name)
            .map(|c| c.rows.len())
            .unwrap_or(0))
    }

    async fn verify_inserted(
        &self,
        name: &str,
        expected: usize,
    ) -> Result<Verification, StoreError> {
        // No quiescence needed: writes are immediately visible.
        let observed = self.count(name).await?;
        Ok(Verification { expected, observed })
    }
}
