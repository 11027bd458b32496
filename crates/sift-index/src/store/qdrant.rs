//! Qdrant-backed vector store.
//!
//! Chunks live as points with the dense embedding under the named vector
//! `"vector"` and, for hybrid collections, the lexical sparse vector under
//! `"sparse_vector"`. Chunk fields travel in the payload; the free-form
//! metadata map is stored JSON-encoded.
//!
//! Calls carry a per-call timeout and recoverable failures (timeouts,
//! transport errors) are retried with bounded backoff.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, value::Kind, vectors_config::Config as VectorsConfigKind,
    Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance,
    Filter, NamedVectors, PointId, PointStruct, PointsIdsList, ScrollPointsBuilder,
    SearchPointsBuilder, SparseIndices, SparseVectorParamsBuilder, SparseVectorsConfigBuilder,
    UpsertPointsBuilder, Value, Vector, VectorParamsBuilder, VectorsConfigBuilder,
};
use qdrant_client::{Qdrant, QdrantError};
use tracing::{debug, info, warn};

use crate::filter::{Field, FilterExpr};
use crate::retry::{with_backoff, RetryPolicy};
use crate::sparse;

use super::{
    fuse_and_rank, ChunkRecord, CollectionSchema, ScoredChunk, SearchOptions, StoreError,
    StoredChunk, SubRequest, Verification, VectorStore, DENSE_VECTOR_FIELD,
    SPARSE_VECTOR_FIELD,
};

/// Page size for filter scans.
const SCROLL_BATCH: u32 = 256;

/// Connection settings for [`QdrantStore`].
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Settle time before post-write verification counts.
    pub quiescence: Duration,
    pub retry: RetryPolicy,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            quiescence: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// Remote [`VectorStore`] over Qdrant.
pub struct QdrantStore {
    client: Qdrant,
    timeout: Duration,
    quiescence: Duration,
    retry: RetryPolicy,
}

impl QdrantStore {
    /// Connect with the given configuration.
    pub fn connect(config: &QdrantConfig) -> Result<Self, StoreError> {
        let mut builder = Qdrant::from_url(&config.url).skip_compatibility_check();
        if let Some(api_key) = &config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder.build().map_err(map_qdrant_err)?;
        info!(url = %config.url, "connected to qdrant");

        Ok(Self {
            client,
            timeout: config.timeout,
            quiescence: config.quiescence,
            retry: config.retry.clone(),
        })
    }

    /// Run one client call with the per-call timeout, retrying
    /// recoverable failures.
    async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QdrantError>>,
    {
        let timeout = self.timeout;
        with_backoff(&self.retry, || {
            let fut = op();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(map_qdrant_err(err)),
                    Err(_) => Err(StoreError::Timeout(format!(
                        "call exceeded {}s",
                        timeout.as_secs()
                    ))),
                }
            }
        })
        .await
    }

    async fn insert_rows(
        &self,
        name: &str,
        rows: Vec<ChunkRecord>,
        hybrid: bool,
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let points: Vec<PointStruct> = rows.into_iter().map(|r| to_point(r, hybrid)).collect();
        debug!(collection = name, points = points.len(), hybrid, "upserting points");
        self.call(|| {
            self.client
                .upsert_points(UpsertPointsBuilder::new(name, points.clone()).wait(true))
        })
        .await?;
        Ok(())
    }

    /// Scan the collection, evaluating `filter` client-side.
    async fn scan_matching(
        &self,
        name: &str,
        filter: &FilterExpr,
        limit: usize,
    ) -> Result<Vec<StoredChunk>, StoreError> {
        let mut matches = Vec::new();
        let mut offset: Option<PointId> = None;

        loop {
            let next_offset = offset.clone();
            let page = self
                .call(|| {
                    let mut builder = ScrollPointsBuilder::new(name)
                        .limit(SCROLL_BATCH)
                        .with_payload(true);
                    if let Some(off) = next_offset.clone() {
                        builder = builder.offset(off);
                    }
                    self.client.scroll(builder)
                })
                .await?;

            for point in page.result {
                let id = point_id_string(point.id.as_ref());
                if let Some(chunk) = payload_to_chunk(id, &point.payload) {
                    if filter.matches(&chunk) {
                        matches.push(chunk);
                        if matches.len() >= limit {
                            return Ok(matches);
                        }
                    }
                }
            }

            match page.next_page_offset {
                Some(next) => offset = Some(next),
                None => return Ok(matches),
            }
        }
    }

    async fn search_sub_request(
        &self,
        name: &str,
        request: &SubRequest,
    ) -> Result<Vec<(String, StoredChunk)>, StoreError> {
        let (field, values, indices, limit) = match request {
            SubRequest::Dense { vector, limit, .. } => {
                (DENSE_VECTOR_FIELD, vector.clone(), None, *limit)
            }
            SubRequest::Sparse {
                text,
                limit,
                drop_ratio,
            } => {
                let query = sparse::encode_query(text, *drop_ratio);
                if query.is_empty() {
                    return Ok(Vec::new());
                }
                (SPARSE_VECTOR_FIELD, query.values, Some(query.indices), *limit)
            }
        };

        let response = self
            .call(|| {
                let mut builder =
                    SearchPointsBuilder::new(name, values.clone(), limit as u64)
                        .vector_name(field)
                        .with_payload(true);
                if let Some(data) = &indices {
                    builder = builder.sparse_indices(SparseIndices { data: data.clone() });
                }
                self.client.search_points(builder)
            })
            .await?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                let id = point_id_string(point.id.as_ref());
                payload_to_chunk(id.clone(), &point.payload).map(|chunk| (id, chunk))
            })
            .collect())
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let response = self.call(|| self.client.list_collections()).await?;
        Ok(response.collections.into_iter().map(|c| c.name).collect())
    }

    async fn has_collection(&self, name: &str) -> Result<bool, StoreError> {
        self.call(|| self.client.collection_exists(name)).await
    }

    async fn describe_collection(
        &self,
        name: &str,
    ) -> Result<Option<CollectionSchema>, StoreError> {
        if !self.has_collection(name).await? {
            return Ok(None);
        }

        let info = self.call(|| self.client.collection_info(name)).await?;
        let params = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .ok_or_else(|| StoreError::Api("collection info missing params".to_string()))?;

        let hybrid = params
            .sparse_vectors_config
            .as_ref()
            .map(|s| s.map.contains_key(SPARSE_VECTOR_FIELD))
            .unwrap_or(false);

        let dimension = params
            .vectors_config
            .and_then(|vc| vc.config)
            .and_then(|config| match config {
                VectorsConfigKind::Params(p) => Some(p.size as usize),
                VectorsConfigKind::ParamsMap(m) => {
                    m.map.get(DENSE_VECTOR_FIELD).map(|p| p.size as usize)
                }
            })
            .ok_or_else(|| {
                StoreError::Api("collection info missing dense vector params".to_string())
            })?;

        Ok(Some(CollectionSchema { dimension, hybrid }))
    }

    async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        hybrid: bool,
    ) -> Result<(), StoreError> {
        if let Some(existing) = self.describe_collection(name).await? {
            if existing.dimension != dimension {
                return Err(StoreError::DimensionMismatch {
                    name: name.to_string(),
                    expected: dimension,
                    actual: existing.dimension,
                });
            }
            if existing.hybrid != hybrid {
                return Err(StoreError::HybridMismatch {
                    name: name.to_string(),
                    expected: hybrid,
                    actual: existing.hybrid,
                });
            }
            debug!(collection = name, "collection already exists with matching schema");
            return Ok(());
        }

        info!(collection = name, dimension, hybrid, "creating collection");
        self.call(|| {
            let mut vectors = VectorsConfigBuilder::default();
            vectors.add_named_vector_params(
                DENSE_VECTOR_FIELD,
                VectorParamsBuilder::new(dimension as u64, Distance::Cosine),
            );

            let mut builder = CreateCollectionBuilder::new(name).vectors_config(vectors);
            if hybrid {
                let mut sparse = SparseVectorsConfigBuilder::default();
                sparse.add_named_vector_params(
                    SPARSE_VECTOR_FIELD,
                    SparseVectorParamsBuilder::default(),
                );
                builder = builder.sparse_vectors_config(sparse);
            }
            self.client.create_collection(builder)
        })
        .await?;
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        if !self.has_collection(name).await? {
            return Ok(());
        }
        info!(collection = name, "dropping collection");
        self.call(|| self.client.delete_collection(name)).await?;
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
        if !self.has_collection(name).await? {
            return Ok(Vec::new());
        }
        self.scan_matching(name, filter, limit).await
    }

    async fn delete_by_filter(
        &self,
        name: &str,
        filter: &FilterExpr,
    ) -> Result<(), StoreError> {
        if !self.has_collection(name).await? {
            return Ok(());
        }

        // Whole-file deletes are a single server-side filter; anything
        // more exotic scans and deletes by id.
        if let Some(path) = filter.as_equality(Field::RelativePath) {
            let server_filter = Filter::must([Condition::matches(
                "relative_path",
                path.to_string(),
            )]);
            self.call(|| {
                self.client.delete_points(
                    DeletePointsBuilder::new(name)
                        .points(server_filter.clone())
                        .wait(true),
                )
            })
            .await?;
            return Ok(());
        }

        let matches = self.scan_matching(name, filter, usize::MAX).await?;
        if matches.is_empty() {
            return Ok(());
        }
        let ids: Vec<PointId> = matches.into_iter().map(|c| PointId::from(c.id)).collect();
        self.call(|| {
            self.client.delete_points(
                DeletePointsBuilder::new(name)
                    .points(PointsIdsList { ids: ids.clone() })
                    .wait(true),
            )
        })
        .await?;
        Ok(())
    }

    async fn hybrid_search(
        &self,
        name: &str,
        requests: Vec<SubRequest>,
        options: &SearchOptions,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if !self.has_collection(name).await? {
            return Ok(Vec::new());
        }

        let mut rankings = Vec::with_capacity(requests.len());
        let mut chunks_by_id: HashMap<String, StoredChunk> = HashMap::new();
        let mut failures = Vec::new();

        for request in &requests {
            match self.search_sub_request(name, request).await {
                Ok(hits) => {
                    let ranking: Vec<String> = hits.iter().map(|(id, _)| id.clone()).collect();
                    for (id, chunk) in hits {
                        chunks_by_id.insert(id, chunk);
                    }
                    rankings.push(ranking);
                }
                Err(err) => {
                    // One failed sub-request degrades the ranking; all of
                    // them failing fails the search.
                    warn!(collection = name, "sub-request failed: {err}");
                    failures.push(err.to_string());
                    rankings.push(Vec::new());
                }
            }
        }

        if !requests.is_empty() && failures.len() == requests.len() {
            return Err(StoreError::AllSubRequestsFailed(failures.join("; ")));
        }

        Ok(fuse_and_rank(&rankings, chunks_by_id, options))
    }

    async fn count(&self, name: &str) -> Result<usize, StoreError> {
        if !self.has_collection(name).await? {
            return Ok(0);
        }
        let response = self
            .call(|| self.client.count(CountPointsBuilder::new(name).exact(true)))
            .await?;
        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }

    async fn verify_inserted(
        &self,
        name: &str,
        expected: usize,
    ) -> Result<Verification, StoreError> {
        tokio::time::sleep(self.quiescence).await;
        let observed = self.count(name).await?;
        Ok(Verification { expected, observed })
    }
}

fn map_qdrant_err(err: QdrantError) -> StoreError {
    let text = err.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("timeout") || lowered.contains("deadline") {
        StoreError::Timeout(text)
    } else if lowered.contains("transport") || lowered.contains("connect") {
        StoreError::Connection(text)
    } else {
        StoreError::Api(text)
    }
}

fn to_point(row: ChunkRecord, hybrid: bool) -> PointStruct {
    let mut payload: HashMap<String, Value> = HashMap::new();
    payload.insert("content".to_string(), Value::from(row.content.clone()));
    payload.insert(
        "relative_path".to_string(),
        Value::from(row.relative_path.clone()),
    );
    payload.insert("start_line".to_string(), Value::from(row.start_line as i64));
    payload.insert("end_line".to_string(), Value::from(row.end_line as i64));
    payload.insert(
        "file_extension".to_string(),
        Value::from(row.file_extension.clone()),
    );
    payload.insert(
        "metadata".to_string(),
        Value::from(serde_json::to_string(&row.metadata).unwrap_or_else(|_| "null".to_string())),
    );

    let mut vectors = NamedVectors::default().add_vector(DENSE_VECTOR_FIELD, row.dense_vector);
    if hybrid {
        let sparse = row
            .sparse_vector
            .unwrap_or_else(|| sparse::encode_document(&row.content));
        vectors = vectors.add_vector(
            SPARSE_VECTOR_FIELD,
            Vector::new_sparse(sparse.indices, sparse.values),
        );
    }

    PointStruct::new(row.id, vectors, payload)
}

fn point_id_string(id: Option<&PointId>) -> String {
    id.and_then(|p| p.point_id_options.as_ref())
        .map(|options| match options {
            PointIdOptions::Uuid(uuid) => uuid.clone(),
            PointIdOptions::Num(num) => num.to_string(),
        })
        .unwrap_or_default()
}

fn payload_to_chunk(id: String, payload: &HashMap<String, Value>) -> Option<StoredChunk> {
    let metadata = extract_string(payload.get("metadata"))
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or(serde_json::Value::Null);

    Some(StoredChunk {
        id,
        content: extract_string(payload.get("content"))?,
        relative_path: extract_string(payload.get("relative_path"))?,
        start_line: extract_integer(payload.get("start_line")) as u32,
        end_line: extract_integer(payload.get("end_line")) as u32,
        file_extension: extract_string(payload.get("file_extension")).unwrap_or_default(),
        metadata,
    })
}

fn extract_string(value: Option<&Value>) -> Option<String> {
    match value?.kind.as_ref()? {
        Kind::StringValue(s) => Some(s.clone()),
        _ => None,
    }
}

fn extract_integer(value: Option<&Value>) -> i64 {
    match value.and_then(|v| v.kind.as_ref()) {
        Some(Kind::IntegerValue(n)) => *n,
        _ => 0,
    }
}
