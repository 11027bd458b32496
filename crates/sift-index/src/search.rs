//! Hybrid query engine.
//!
//! Embeds the query text, issues a dense and a sparse sub-request against
//! the collection, and fuses the two rankings with reciprocal rank fusion
//! (`k = 100`). Dense-only collections degrade to a dense-only ranking,
//! reported through the `degraded` flag rather than an error.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::embeddings::{EmbeddingClient, EmbeddingError};
use crate::filter::FilterExpr;
use crate::store::{
    ScoredChunk, SearchOptions, StoreError, SubRequest, VectorStore, RRF_K,
};

/// `nprobe` passed to the dense sub-request.
const DENSE_NPROBE: u32 = 10;

/// Sparse term pruning ratio for query encoding.
const SPARSE_DROP_RATIO: f32 = 0.2;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("query vector dimension {actual} does not match collection dimension {expected}; re-index with a clean run to change models")]
    SchemaMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One search request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub collection: String,
    pub query: String,
    pub limit: usize,
    pub filter: Option<FilterExpr>,
}

impl SearchRequest {
    pub fn new(collection: impl Into<String>, query: impl Into<String>, limit: usize) -> Self {
        Self {
            collection: collection.into(),
            query: query.into(),
            limit,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: FilterExpr) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Search response: fused hits plus whether the sparse leg was skipped.
#[derive(Debug)]
pub struct SearchResponse {
    pub hits: Vec<ScoredChunk>,
    /// True when the collection is dense-only and the ranking fell back
    /// to the dense sub-request alone.
    pub degraded: bool,
}

/// Hybrid searcher over one embedding client and one vector store.
pub struct SearchEngine<E, S>
where
    E: EmbeddingClient,
    S: VectorStore,
{
    embeddings: Arc<E>,
    store: Arc<S>,
}

impl<E, S> SearchEngine<E, S>
where
    E: EmbeddingClient,
    S: VectorStore,
{
    pub fn new(embeddings: Arc<E>, store: Arc<S>) -> Self {
        Self { embeddings, store }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse, SearchError> {
        let schema = match self.store.describe_collection(&request.collection).await? {
            Some(schema) => schema,
            // Nothing indexed yet: empty result, not an error.
            None => {
                return Ok(SearchResponse {
                    hits: Vec::new(),
                    degraded: false,
                })
            }
        };

        let embedding = self.embeddings.embed(&request.query).await?;
        if embedding.dimension != schema.dimension {
            return Err(SearchError::SchemaMismatch {
                expected: schema.dimension,
                actual: embedding.dimension,
            });
        }

        let mut sub_requests = vec![SubRequest::Dense {
            vector: embedding.vector,
            limit: request.limit,
            nprobe: DENSE_NPROBE,
        }];
        let degraded = if schema.hybrid {
            sub_requests.push(SubRequest::Sparse {
                text: request.query.clone(),
                limit: request.limit,
                drop_ratio: SPARSE_DROP_RATIO,
            });
            false
        } else {
            debug!(
                collection = %request.collection,
                "dense-only collection, skipping sparse sub-request"
            );
            true
        };

        let options = SearchOptions {
            limit: request.limit,
            rrf_k: RRF_K,
            filter: request.filter.clone(),
        };
        let hits = self
            .store
            .hybrid_search(&request.collection, sub_requests, &options)
            .await?;

        Ok(SearchResponse { hits, degraded })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::ChunkRecord;
    use async_trait::async_trait;

    /// Deterministic embedder: maps known phrases to fixed unit vectors.
    struct PhraseEmbedder {
        dimension: usize,
    }

    #[async_trait]
    impl EmbeddingClient for PhraseEmbedder {
        async fn embed(&self, text: &str) -> Result<crate::embeddings::Embedding, EmbeddingError> {
            let mut vector = vec![0.0f32; self.dimension];
            // Crude but stable direction per text.
            let bucket = text.len() % self.dimension;
            vector[bucket] = 1.0;
            Ok(crate::embeddings::Embedding {
                dimension: vector.len(),
                vector,
            })
        }

        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> Result<Vec<crate::embeddings::Embedding>, EmbeddingError> {
            let mut out = Vec::new();
            for text in texts {
                out.push(self.embed(text).await?);
            }
            Ok(out)
        }

        async fn detect_dimension(&self, _probe: &str) -> Result<usize, EmbeddingError> {
            Ok(self.dimension)
        }

        fn get_dimension(&self) -> Option<usize> {
            Some(self.dimension)
        }

        fn model_name(&self) -> &str {
            "phrase-embedder"
        }
    }

    fn record(id: &str, content: &str, dense: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            dense_vector: dense,
            content: content.to_string(),
            relative_path: format!("src/{id}.rs"),
            start_line: 1,
            end_line: 2,
            file_extension: "rs".to_string(),
            metadata: serde_json::Value::Null,
            sparse_vector: None,
        }
    }

    #[tokio::test]
    async fn missing_collection_is_empty_not_error() {
        let engine = SearchEngine::new(
            Arc::new(PhraseEmbedder { dimension: 4 }),
            Arc::new(MemoryStore::new()),
        );
        let response = engine
            .search(SearchRequest::new("absent", "anything", 5))
            .await
            .unwrap();
        assert!(response.hits.is_empty());
        assert!(!response.degraded);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_schema_error() {
        let store = Arc::new(MemoryStore::new());
        store.create_collection("c", 8, false).await.unwrap();

        let engine = SearchEngine::new(Arc::new(PhraseEmbedder { dimension: 4 }), store);
        let err = engine
            .search(SearchRequest::new("c", "query", 5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SearchError::SchemaMismatch { expected: 8, actual: 4 }
        ));
    }

    #[tokio::test]
    async fn dense_only_collection_reports_degraded() {
        let store = Arc::new(MemoryStore::new());
        store.create_collection("c", 4, false).await.unwrap();
        store
            .insert("c", vec![record("a", "alpha", vec![1.0, 0.0, 0.0, 0.0])])
            .await
            .unwrap();

        let engine = SearchEngine::new(Arc::new(PhraseEmbedder { dimension: 4 }), store);
        let response = engine
            .search(SearchRequest::new("c", "quer", 5))
            .await
            .unwrap();
        assert!(response.degraded);
    }

    #[tokio::test]
    async fn hybrid_collection_is_not_degraded() {
        let store = Arc::new(MemoryStore::new());
        store.create_collection("c", 4, true).await.unwrap();
        store
            .insert_hybrid("c", vec![record("a", "retry backoff", vec![1.0, 0.0, 0.0, 0.0])])
            .await
            .unwrap();

        let engine = SearchEngine::new(Arc::new(PhraseEmbedder { dimension: 4 }), store);
        let response = engine
            .search(SearchRequest::new("c", "retry", 5))
            .await
            .unwrap();
        assert!(!response.degraded);
        assert!(!response.hits.is_empty());
    }

    #[tokio::test]
    async fn limit_caps_results() {
        let store = Arc::new(MemoryStore::new());
        store.create_collection("c", 4, false).await.unwrap();
        let rows: Vec<ChunkRecord> = (0..10)
            .map(|i| {
                let mut dense = vec![0.0; 4];
                dense[i % 4] = 1.0;
                record(&format!("r{i}"), "content", dense)
            })
            .collect();
        store.insert("c", rows).await.unwrap();

        let engine = SearchEngine::new(Arc::new(PhraseEmbedder { dimension: 4 }), store);
        let response = engine
            .search(SearchRequest::new("c", "quer", 3))
            .await
            .unwrap();
        assert!(response.hits.len() <= 3);

        // Strictly decreasing after the id tie-break.
        for pair in response.hits.windows(2) {
            assert!(
                pair[0].score > pair[1].score
                    || (pair[0].score == pair[1].score
                        && pair[0].chunk.id < pair[1].chunk.id)
            );
        }
    }

    #[tokio::test]
    async fn post_filter_applies_to_fused_hits() {
        let store = Arc::new(MemoryStore::new());
        store.create_collection("c", 4, false).await.unwrap();
        store
            .insert(
                "c",
                vec![
                    record("a", "x", vec![1.0, 0.0, 0.0, 0.0]),
                    record("b", "y", vec![0.9, 0.1, 0.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let engine = SearchEngine::new(Arc::new(PhraseEmbedder { dimension: 4 }), store);
        let response = engine
            .search(
                SearchRequest::new("c", "quer", 5)
                    .with_filter(FilterExpr::path_equals("src/b.rs")),
            )
            .await
            .unwrap();
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.hits[0].chunk.id, "b");
    }
}
