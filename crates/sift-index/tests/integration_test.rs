//! End-to-end indexing and search scenarios against the in-memory store.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use sift_index::embeddings::{Embedding, EmbeddingClient, EmbeddingError};
use sift_index::indexer::{IndexController, IndexOptions, RunStatus};
use sift_index::lock::ProjectLock;
use sift_index::progress::NoProgress;
use sift_index::search::{SearchEngine, SearchRequest};
use sift_index::store::memory::MemoryStore;
use sift_index::store::VectorStore;
use sift_index::{naming, FilterExpr, IndexError, ProjectMetadata, CONTEXT_DIR};

/// Deterministic embedding client: each text maps to a fixed unit vector,
/// and every `embed_batch` call records its input.
struct MockEmbeddings {
    dimension: usize,
    ceiling: Option<usize>,
    batch_calls: Mutex<Vec<Vec<String>>>,
    probed: AtomicBool,
}

impl MockEmbeddings {
    fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ceiling: None,
            batch_calls: Mutex::new(Vec::new()),
            probed: AtomicBool::new(false),
        }
    }

    fn with_ceiling(dimension: usize, ceiling: usize) -> Self {
        Self {
            ceiling: Some(ceiling),
            ..Self::new(dimension)
        }
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batch_calls.lock().unwrap().iter().map(|b| b.len()).collect()
    }

    fn embedded_texts(&self) -> Vec<String> {
        self.batch_calls.lock().unwrap().iter().flatten().cloned().collect()
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut hash = 2166136261u32;
        for byte in text.bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(16777619);
        }
        let mut vector = vec![0.0f32; self.dimension];
        vector[(hash as usize) % self.dimension] = 1.0;
        vector
    }
}

#[async_trait]
impl EmbeddingClient for MockEmbeddings {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        Ok(Embedding {
            vector: self.vector_for(text),
            dimension: self.dimension,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        self.batch_calls.lock().unwrap().push(texts.to_vec());
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(Embedding {
                vector: self.vector_for(text),
                dimension: self.dimension,
            });
        }
        Ok(out)
    }

    async fn detect_dimension(&self, _probe_text: &str) -> Result<usize, EmbeddingError> {
        self.probed.store(true, Ordering::SeqCst);
        Ok(self.dimension)
    }

    fn get_dimension(&self) -> Option<usize> {
        if self.probed.load(Ordering::SeqCst) {
            Some(self.dimension)
        } else {
            None
        }
    }

    fn model_name(&self) -> &str {
        "mock-embedder"
    }

    fn batch_ceiling(&self) -> Option<usize> {
        self.ceiling
    }
}

struct Harness {
    project: TempDir,
    logs: TempDir,
    embeddings: Arc<MockEmbeddings>,
    store: Arc<MemoryStore>,
    controller: IndexController<MockEmbeddings, MemoryStore>,
}

impl Harness {
    fn new(embeddings: MockEmbeddings) -> Self {
        let embeddings = Arc::new(embeddings);
        let store = Arc::new(MemoryStore::new());
        let controller = IndexController::new(embeddings.clone(), store.clone());
        Self {
            project: TempDir::new().unwrap(),
            logs: TempDir::new().unwrap(),
            embeddings,
            store,
            controller,
        }
    }

    fn write(&self, relative: &str, content: &str) {
        let path = self.project.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn remove(&self, relative: &str) {
        fs::remove_file(self.project.path().join(relative)).unwrap();
    }

    fn options(&self, extensions: &[&str]) -> IndexOptions {
        let mut options = IndexOptions::new(self.project.path());
        options.extensions = extensions.iter().map(|s| s.to_string()).collect();
        options.logs_dir = Some(self.logs.path().to_path_buf());
        options
    }

    async fn run(&self, options: &IndexOptions) -> Result<sift_index::RunSummary, IndexError> {
        self.controller
            .index(options, &NoProgress, &CancellationToken::new())
            .await
    }

    fn collection(&self, hybrid: bool) -> String {
        naming::for_project_path(self.project.path(), hybrid)
    }

    async fn rows_for(&self, collection: &str, path: &str) -> usize {
        self.store
            .query(collection, &FilterExpr::path_equals(path), 1000)
            .await
            .unwrap()
            .len()
    }
}

const TS_FN_A: &str = "function alpha(a: number, b: number): number {\n    const sum = a + b;\n    return sum;\n}\n";
const TS_FN_B: &str = "function beta(name: string): string {\n    return `hello ${name}`;\n}\n";

#[tokio::test]
async fn fresh_small_project() {
    let h = Harness::new(MockEmbeddings::new(4));
    h.write("src/a.ts", TS_FN_A);
    h.write("src/b.ts", TS_FN_B);
    h.write("README.md", "# readme\nnot indexed\n");

    let summary = h.run(&h.options(&["ts"])).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.indexed_files, 2);
    assert_eq!(summary.total_chunks, 2);
    assert!(summary.failures.is_empty());

    // One batched embedding call covering both chunks.
    assert_eq!(h.embeddings.batch_sizes(), vec![2]);

    // Collection exists with the probe-detected dimension.
    let collection = h.collection(false);
    let schema = h.store.describe_collection(&collection).await.unwrap().unwrap();
    assert_eq!(schema.dimension, 4);
    assert!(!schema.hybrid);
    assert_eq!(h.store.count(&collection).await.unwrap(), 2);

    // Committed metadata reflects the run.
    let meta = ProjectMetadata::load(h.project.path()).unwrap().unwrap();
    assert_eq!(meta.collection_name, collection);
    assert_eq!(meta.indexed_file_count, 2);
    assert_eq!(meta.total_chunks, 2);
    assert_eq!(meta.embedding_dimension, 4);

    // A JSONL run log was written.
    let logs: Vec<_> = fs::read_dir(h.logs.path()).unwrap().collect();
    assert_eq!(logs.len(), 1);
}

#[tokio::test]
async fn reindex_without_changes_is_free() {
    let h = Harness::new(MockEmbeddings::new(4));
    h.write("src/a.ts", TS_FN_A);
    h.write("src/b.ts", TS_FN_B);

    let options = h.options(&["ts"]);
    h.run(&options).await.unwrap();
    let calls_before = h.embeddings.batch_sizes().len();

    let summary = h.run(&options).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.indexed_files, 0);
    assert_eq!(summary.skipped_unchanged, 2);
    // No embedding API calls for unchanged files.
    assert_eq!(h.embeddings.batch_sizes().len(), calls_before);
}

#[tokio::test]
async fn incremental_single_file_edit() {
    let h = Harness::new(MockEmbeddings::new(4));
    h.write("src/a.ts", TS_FN_A);
    h.write("src/b.ts", TS_FN_B);

    let options = h.options(&["ts"]);
    h.run(&options).await.unwrap();

    let cache_b_before = fs::read_to_string(
        h.project.path().join(CONTEXT_DIR).join("file-hashes.json"),
    )
    .unwrap();
    assert!(cache_b_before.contains("src/b.ts"));

    // Append a second function to a.ts.
    let edited = format!("{TS_FN_A}\nfunction gamma(): number {{\n    return 3;\n}}\n");
    h.write("src/a.ts", &edited);
    h.embeddings.batch_calls.lock().unwrap().clear();

    let summary = h.run(&options).await.unwrap();

    assert_eq!(summary.indexed_files, 1);
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.skipped_unchanged, 1);

    // Embedding was issued only for the edited file's chunks.
    let embedded = h.embeddings.embedded_texts();
    assert!(!embedded.is_empty());
    assert!(embedded.iter().all(|t| t.contains("alpha") || t.contains("gamma")));
    assert!(embedded.iter().all(|t| !t.contains("beta")));

    // Replace-whole-file: a.ts has exactly its new chunks, b.ts untouched.
    let collection = h.collection(false);
    assert_eq!(h.rows_for(&collection, "src/a.ts").await, 2);
    assert_eq!(h.rows_for(&collection, "src/b.ts").await, 1);
    assert_eq!(summary.total_chunks, 3);
}

#[tokio::test]
async fn deletion_removes_chunks_and_cache_entry() {
    let h = Harness::new(MockEmbeddings::new(4));
    h.write("src/a.ts", TS_FN_A);
    h.write("src/b.ts", TS_FN_B);

    let options = h.options(&["ts"]);
    h.run(&options).await.unwrap();
    h.embeddings.batch_calls.lock().unwrap().clear();

    h.remove("src/b.ts");
    let summary = h.run(&options).await.unwrap();

    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.indexed_files, 0);
    // Deletion issues no embedding calls.
    assert!(h.embeddings.batch_sizes().is_empty());

    let collection = h.collection(false);
    assert_eq!(h.rows_for(&collection, "src/b.ts").await, 0);
    assert_eq!(h.rows_for(&collection, "src/a.ts").await, 1);

    let cache_text = fs::read_to_string(
        h.project.path().join(CONTEXT_DIR).join("file-hashes.json"),
    )
    .unwrap();
    assert!(!cache_text.contains("src/b.ts"));

    let meta = ProjectMetadata::load(h.project.path()).unwrap().unwrap();
    assert_eq!(meta.indexed_file_count, 1);
    assert_eq!(meta.total_chunks, 1);
}

#[tokio::test]
async fn dimension_mismatch_aborts_without_writes() {
    let h = Harness::new(MockEmbeddings::new(4));
    h.write("src/a.ts", TS_FN_A);
    let options = h.options(&["ts"]);
    h.run(&options).await.unwrap();

    let collection = h.collection(false);
    let rows_before = h.store.count(&collection).await.unwrap();
    let cache_before = fs::read_to_string(
        h.project.path().join(CONTEXT_DIR).join("file-hashes.json"),
    )
    .unwrap();
    let meta_before = ProjectMetadata::load(h.project.path()).unwrap().unwrap();

    // Operator switches to a model with a different output size.
    let wider = Arc::new(MockEmbeddings::new(8));
    let controller = IndexController::new(wider, h.store.clone());
    h.write("src/a.ts", "function changed(): number { return 1; }\n");

    let err = controller
        .index(&options, &NoProgress, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        IndexError::Configuration(message) => assert!(message.contains("--clean")),
        other => panic!("expected configuration error, got {other:?}"),
    }

    // Nothing was written.
    assert_eq!(h.store.count(&collection).await.unwrap(), rows_before);
    let cache_after = fs::read_to_string(
        h.project.path().join(CONTEXT_DIR).join("file-hashes.json"),
    )
    .unwrap();
    assert_eq!(cache_before, cache_after);
    assert_eq!(
        ProjectMetadata::load(h.project.path()).unwrap().unwrap(),
        meta_before
    );
}

#[tokio::test]
async fn clean_rebuild_is_reproducible() {
    let h = Harness::new(MockEmbeddings::new(4));
    h.write("src/a.ts", TS_FN_A);
    h.write("src/b.ts", TS_FN_B);

    let mut options = h.options(&["ts"]);
    options.clean = true;

    h.run(&options).await.unwrap();
    let collection = h.collection(false);
    let all = FilterExpr::parse("startLine >= 0").unwrap();
    let mut ids_first: Vec<String> = h
        .store
        .query(&collection, &all, 1000)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    ids_first.sort();

    h.run(&options).await.unwrap();
    let mut ids_second: Vec<String> = h
        .store
        .query(&collection, &all, 1000)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    ids_second.sort();

    // Chunk ids are hash-stable, so two clean runs agree exactly.
    assert_eq!(ids_first, ids_second);
    assert_eq!(ids_first.len(), 2);
}

#[tokio::test]
async fn empty_project_creates_no_collection() {
    let h = Harness::new(MockEmbeddings::new(4));
    h.write("README.md", "# nothing indexable\n");

    let summary = h.run(&h.options(&["ts"])).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.total_chunks, 0);
    assert!(h.store.list_collections().await.unwrap().is_empty());

    let meta = ProjectMetadata::load(h.project.path()).unwrap().unwrap();
    assert_eq!(meta.total_chunks, 0);
    assert_eq!(meta.indexed_file_count, 0);
}

#[tokio::test]
async fn provider_batch_ceiling_splits_requests() {
    let h = Harness::new(MockEmbeddings::with_ceiling(4, 10));
    // 23 files, one chunk each.
    for i in 0..23 {
        h.write(
            &format!("src/f{i:02}.ts"),
            &format!("function fn{i:02}(): number {{\n    return {i};\n}}\n"),
        );
    }

    let summary = h.run(&h.options(&["ts"])).await.unwrap();
    assert_eq!(summary.total_chunks, 23);

    let sizes = h.embeddings.batch_sizes();
    assert_eq!(sizes.iter().sum::<usize>(), 23);
    assert_eq!(sizes, vec![10, 10, 3]);

    // Order preserved: every chunk searched by its own content comes back.
    let engine = SearchEngine::new(h.embeddings.clone(), h.store.clone());
    let response = engine
        .search(SearchRequest::new(h.collection(false), "function fn07", 5))
        .await
        .unwrap();
    assert!(!response.hits.is_empty());
}

#[tokio::test]
async fn hybrid_end_to_end_search() {
    let h = Harness::new(MockEmbeddings::new(4));
    h.write(
        "src/cache.ts",
        "function invalidateHashCache(cache: Map<string, string>): void {\n    cache.clear();\n}\n",
    );
    h.write(
        "src/walker.ts",
        "function walkDirectory(root: string): string[] {\n    return [];\n}\n",
    );

    let mut options = h.options(&["ts"]);
    options.hybrid = true;
    let summary = h.run(&options).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);

    let collection = h.collection(true);
    assert!(collection.starts_with("hybrid_code_chunks_"));

    let engine = SearchEngine::new(h.embeddings.clone(), h.store.clone());
    let response = engine
        .search(SearchRequest::new(&collection, "invalidateHashCache cache", 5))
        .await
        .unwrap();

    assert!(!response.degraded);
    assert!(!response.hits.is_empty());
    assert_eq!(response.hits[0].chunk.relative_path, "src/cache.ts");

    // Scores strictly decrease (ties broken by id upstream).
    for pair in response.hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn cancelled_run_is_partial_and_persists_nothing_new() {
    let h = Harness::new(MockEmbeddings::new(4));
    h.write("src/a.ts", TS_FN_A);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = h
        .controller
        .index(&h.options(&["ts"]), &NoProgress, &cancel)
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Partial);
    assert_eq!(summary.indexed_files, 0);
    assert!(h.embeddings.batch_sizes().is_empty());
}

#[tokio::test]
async fn concurrent_run_is_rejected_by_lock() {
    let h = Harness::new(MockEmbeddings::new(4));
    h.write("src/a.ts", TS_FN_A);

    let context_dir = h.project.path().join(CONTEXT_DIR);
    fs::create_dir_all(&context_dir).unwrap();
    let _held = ProjectLock::acquire(&context_dir).unwrap();

    let err = h.run(&h.options(&["ts"])).await.unwrap_err();
    assert!(matches!(err, IndexError::Locked(_)));
}

#[test]
fn search_fusion_reference_ranking() {
    use sift_index::store::rrf_fuse;

    // Dense: [d1, d2, d3]; sparse: [d3, d4, d5]; k = 100.
    let fused = rrf_fuse(
        &[
            vec!["d1".into(), "d2".into(), "d3".into()],
            vec!["d3".into(), "d4".into(), "d5".into()],
        ],
        100.0,
    );

    let score = |id: &str| fused.iter().find(|(i, _)| i == id).unwrap().1;
    assert!((score("d3") - (1.0 / 103.0 + 1.0 / 101.0)).abs() < 1e-9);
    assert!((score("d1") - 1.0 / 101.0).abs() < 1e-9);
    assert!((score("d2") - 1.0 / 102.0).abs() < 1e-9);
    assert!((score("d4") - 1.0 / 102.0).abs() < 1e-9);
    assert!((score("d5") - 1.0 / 103.0).abs() < 1e-9);

    // Top three: d3, d1, then the alphabetically earlier of the d2/d4 tie.
    let ids: Vec<&str> = fused.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(&ids[..3], &["d3", "d1", "d2"]);
}
