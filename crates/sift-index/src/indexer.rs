//! Indexing controller.
//!
//! Brings the vector store collection for a project into agreement with
//! the working tree at minimum API cost: discover files, diff against the
//! hash cache, re-chunk and re-embed only what changed, delete what
//! disappeared, then persist cache and metadata (in that order).
//!
//! Within a run each file transitions atomically: its prior chunks are
//! deleted by a filtered delete before the new chunks are inserted, and
//! its cache entry is only updated after the insert succeeds. A fatal
//! error aborts the run and leaves cache and metadata untouched for the
//! files not yet processed, so the next run picks them up again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{HashCache, CONTEXT_DIR};
use crate::chunker::{Chunker, SourceChunk};
use crate::embeddings::{resolve_dimension, EmbeddingClient};
use crate::error::IndexError;
use crate::filter::FilterExpr;
use crate::lock::ProjectLock;
use crate::logger::IndexLogger;
use crate::metadata::ProjectMetadata;
use crate::naming;
use crate::progress::{IndexPhase, ProgressEvent, ProgressReporter};
use crate::store::{ChunkRecord, StoreError, VectorStore, Verification};
use crate::walker::FileWalker;

/// Extensions indexed when the caller does not supply a whitelist.
pub const DEFAULT_EXTENSIONS: &[&str] = &["rs", "py", "js", "jsx", "ts", "tsx", "go"];

/// Files above this size are skipped by discovery.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Controller-level embedding batch size when the provider declares no
/// ceiling; bounds how much work is in flight between cancellation checks.
const DEFAULT_EMBED_BATCH: usize = 32;

/// Options for one indexing run.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub project_path: PathBuf,
    /// Git remote identifier; collection names derive from it when set.
    pub git_identifier: Option<String>,
    /// Store lexical sparse vectors next to the dense ones.
    pub hybrid: bool,
    /// Drop the collection and cache first, then index from scratch.
    pub clean: bool,
    pub extensions: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub max_file_bytes: u64,
    /// Run-log directory override; defaults to `<home>/.context/logs`.
    pub logs_dir: Option<PathBuf>,
}

impl IndexOptions {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            git_identifier: None,
            hybrid: false,
            clean: false,
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            exclude_globs: Vec::new(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            logs_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Partial,
    Failed,
}

/// One file the run could not process; it stays in the changed set for
/// the next run.
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub reason: String,
}

/// What one indexing run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub indexed_files: usize,
    pub total_chunks: usize,
    pub skipped_unchanged: usize,
    pub deleted: usize,
    pub failures: Vec<FileFailure>,
    pub verification: Option<VerificationSummary>,
    pub duration_ms: u64,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct VerificationSummary {
    pub expected: usize,
    pub observed: usize,
}

impl From<Verification> for VerificationSummary {
    fn from(v: Verification) -> Self {
        Self {
            expected: v.expected,
            observed: v.observed,
        }
    }
}

/// A changed file after chunking, waiting for vectors and insertion.
struct FileWork {
    relative: String,
    content_hash: String,
    modified_ms: i64,
    records: Vec<ChunkRecord>,
    embedded: bool,
}

/// Orchestrates indexing runs against one embedding client and one store.
pub struct IndexController<E, S>
where
    E: EmbeddingClient,
    S: VectorStore,
{
    embeddings: Arc<E>,
    store: Arc<S>,
}

impl<E, S> IndexController<E, S>
where
    E: EmbeddingClient,
    S: VectorStore,
{
    pub fn new(embeddings: Arc<E>, store: Arc<S>) -> Self {
        Self { embeddings, store }
    }

    /// Run one full or incremental indexing pass.
    pub async fn index(
        &self,
        options: &IndexOptions,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, IndexError> {
        let start = Instant::now();
        let project_root = options.project_path.as_path();
        let context_dir = project_root.join(CONTEXT_DIR);

        let _lock = ProjectLock::acquire(&context_dir)?;
        let logger = open_run_logger(options);
        if let Some(logger) = &logger {
            logger.info(
                "indexing run started",
                Some(serde_json::json!({
                    "hybrid": options.hybrid,
                    "clean": options.clean,
                    "model": self.embeddings.model_name(),
                })),
            );
        }

        let dimension = resolve_dimension(self.embeddings.as_ref()).await?;
        let model = self.embeddings.model_name().to_string();

        // Collection name: reuse the committed metadata when it still
        // matches the current configuration, otherwise derive it.
        let existing_metadata = load_metadata_lenient(project_root);
        let collection = match &existing_metadata {
            Some(meta)
                if meta.is_hybrid == options.hybrid && meta.embedding_model == model =>
            {
                meta.collection_name.clone()
            }
            _ => match &options.git_identifier {
                Some(id) => naming::for_git_identifier(id, options.hybrid),
                None => naming::for_project_path(project_root, options.hybrid),
            },
        };
        debug!(collection = %collection, dimension, "resolved collection");

        let mut cache = HashCache::load(project_root, &collection);

        if options.clean || cache.is_stale() {
            info!(
                collection = %collection,
                clean = options.clean,
                stale = cache.is_stale(),
                "full rebuild: dropping collection and cache"
            );
            self.store.drop_collection(&collection).await?;
            cache.clear()?;
        }

        // Schema pre-check happens before any write so a model switch
        // aborts with nothing touched.
        let mut collection_exists = false;
        if let Some(schema) = self.store.describe_collection(&collection).await? {
            if schema.dimension != dimension {
                return Err(IndexError::dimension_mismatch(
                    &collection,
                    schema.dimension,
                    dimension,
                ));
            }
            if schema.hybrid != options.hybrid {
                return Err(IndexError::Configuration(format!(
                    "collection '{collection}' hybrid flag is {}, requested {}; run with --clean to rebuild",
                    schema.hybrid, options.hybrid
                )));
            }
            collection_exists = true;
        }

        // ---- Discovering ----
        reporter.report(ProgressEvent::new(IndexPhase::Discovering, 0, 0));
        let walker = FileWalker::new(
            project_root,
            &options.extensions,
            &options.exclude_globs,
            options.max_file_bytes,
        )?;
        let (files, walk_stats) = walker.walk();
        reporter.report(
            ProgressEvent::new(IndexPhase::Discovering, files.len() as u64, files.len() as u64)
                .with_detail(format!(
                    "oversize: {}, binary: {}, unreadable: {}",
                    walk_stats.oversize, walk_stats.binary, walk_stats.unreadable
                )),
        );

        // ---- Diffing ----
        let mut failures: Vec<FileFailure> = Vec::new();
        let mut changed: Vec<(String, PathBuf, String, i64, Vec<u8>)> = Vec::new();
        let mut current_files: HashSet<String> = HashSet::new();
        let total_files = files.len() as u64;

        for (i, file) in files.iter().enumerate() {
            current_files.insert(file.relative.clone());
            match std::fs::read(&file.absolute) {
                Ok(bytes) => {
                    let hash = sha256_hex(&bytes);
                    if cache.has_file_changed(&file.relative, &hash) {
                        let modified_ms = file_mtime_ms(&file.absolute);
                        changed.push((
                            file.relative.clone(),
                            file.absolute.clone(),
                            hash,
                            modified_ms,
                            bytes,
                        ));
                    }
                }
                Err(err) => {
                    warn!(path = %file.relative, "read failed, skipping: {err}");
                    failures.push(FileFailure {
                        path: file.relative.clone(),
                        reason: format!("read failed: {err}"),
                    });
                }
            }
            reporter.report(ProgressEvent::new(
                IndexPhase::Diffing,
                (i + 1) as u64,
                total_files,
            ));
        }

        // Unreadable files stay out of the diff entirely: neither
        // re-embedded nor treated as deleted.
        for path in &walk_stats.unreadable_paths {
            current_files.insert(path.clone());
            failures.push(FileFailure {
                path: path.clone(),
                reason: "unreadable".to_string(),
            });
        }

        let deleted_paths = cache.deleted_files(&current_files);
        // Everything in failures at this point is a read failure.
        let unchanged = current_files.len() - changed.len() - failures.len();

        if let Some(logger) = &logger {
            logger.info(
                "diff computed",
                Some(serde_json::json!({
                    "changed": changed.len(),
                    "deleted": deleted_paths.len(),
                    "unchanged": unchanged,
                })),
            );
        }

        // Nothing to do: report and stop without touching the store.
        if changed.is_empty() && deleted_paths.is_empty() {
            reporter.report(
                ProgressEvent::new(IndexPhase::Done, 0, 0)
                    .with_detail(format!("unchanged: {unchanged}")),
            );
            ensure_metadata(
                project_root,
                existing_metadata,
                &collection,
                options,
                &model,
                dimension,
                &cache,
            )?;
            let status = if failures.is_empty() {
                RunStatus::Completed
            } else {
                RunStatus::Partial
            };
            let summary = RunSummary {
                indexed_files: 0,
                total_chunks: cache.total_chunks(),
                skipped_unchanged: unchanged,
                deleted: 0,
                failures,
                verification: None,
                duration_ms: start.elapsed().as_millis() as u64,
                status,
            };
            if let Some(logger) = &logger {
                logger.info("run finished with no changes", None);
            }
            return Ok(summary);
        }

        // ---- Deleting ----
        let mut deleted_count = 0usize;
        let delete_total = deleted_paths.len() as u64;
        for (i, path) in deleted_paths.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            match self
                .store
                .delete_by_filter(&collection, &FilterExpr::path_equals(path))
                .await
            {
                Ok(()) => {
                    cache.remove_file(path);
                    deleted_count += 1;
                }
                Err(err) => {
                    warn!(path = %path, "delete failed: {err}");
                    failures.push(FileFailure {
                        path: path.clone(),
                        reason: format!("delete failed: {err}"),
                    });
                }
            }
            reporter.report(ProgressEvent::new(
                IndexPhase::Deleting,
                (i + 1) as u64,
                delete_total,
            ));
        }

        // ---- Chunking ----
        let mut chunker = Chunker::new()?;
        let project_key = project_root.to_string_lossy().into_owned();
        let mut work: Vec<FileWork> = Vec::with_capacity(changed.len());
        let chunk_total = changed.len() as u64;

        for (i, (relative, _absolute, hash, modified_ms, bytes)) in
            changed.into_iter().enumerate()
        {
            let text = String::from_utf8_lossy(&bytes);
            let extension = extension_of(&relative);
            let source_chunks = chunker.chunk(&text, &extension);
            let records = source_chunks
                .into_iter()
                .map(|chunk| to_record(&project_key, &relative, &extension, chunk))
                .collect();
            work.push(FileWork {
                relative,
                content_hash: hash,
                modified_ms,
                records,
                embedded: false,
            });
            reporter.report(ProgressEvent::new(
                IndexPhase::Chunking,
                (i + 1) as u64,
                chunk_total,
            ));
        }

        // ---- Embedding ----
        // Batches are assembled across file boundaries so the provider
        // ceiling is saturated; a file only proceeds to insertion once
        // every one of its chunks has a vector.
        let mut slots: Vec<(usize, usize)> = Vec::new();
        let mut texts: Vec<String> = Vec::new();
        for (file_idx, file) in work.iter().enumerate() {
            for (chunk_idx, record) in file.records.iter().enumerate() {
                slots.push((file_idx, chunk_idx));
                texts.push(record.content.clone());
            }
        }

        let embed_total = texts.len() as u64;
        let batch_size = self
            .embeddings
            .batch_ceiling()
            .unwrap_or(DEFAULT_EMBED_BATCH)
            .max(1);
        let mut embedded_upto = 0usize;
        let mut cancelled = false;

        while embedded_upto < texts.len() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let end = (embedded_upto + batch_size).min(texts.len());
            let embeddings = self
                .embeddings
                .embed_batch(&texts[embedded_upto..end])
                .await?;
            for (offset, embedding) in embeddings.into_iter().enumerate() {
                if embedding.dimension != dimension {
                    return Err(IndexError::dimension_mismatch(
                        &collection,
                        dimension,
                        embedding.dimension,
                    ));
                }
                let (file_idx, chunk_idx) = slots[embedded_upto + offset];
                work[file_idx].records[chunk_idx].dense_vector = embedding.vector;
            }
            embedded_upto = end;
            reporter.report(ProgressEvent::new(
                IndexPhase::Embedding,
                embedded_upto as u64,
                embed_total,
            ));
        }

        // Mark files whose chunks all received vectors.
        {
            let mut covered = 0usize;
            for file in work.iter_mut() {
                let next = covered + file.records.len();
                file.embedded = next <= embedded_upto;
                covered = next;
            }
        }

        // ---- Indexing files ----
        // Collection creation is deferred until the first insert is
        // actually needed, so an empty project never creates one.
        if !collection_exists && work.iter().any(|f| f.embedded && !f.records.is_empty()) {
            self.store
                .create_collection(&collection, dimension, options.hybrid)
                .await?;
            collection_exists = true;
        }

        let mut indexed_files = 0usize;
        let mut inserted_rows = 0usize;
        let index_total = work.len() as u64;

        for (i, file) in work.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if !file.embedded {
                cancelled = true;
                break;
            }

            // Replace whole file: prior chunks are removed before the new
            // ones go in.
            let result = self.index_one_file(&collection, options.hybrid, file).await;
            match result {
                Ok(()) => {
                    cache.update_file(
                        &file.relative,
                        file.content_hash.clone(),
                        file.modified_ms,
                        file.records.len(),
                    );
                    indexed_files += 1;
                    inserted_rows += file.records.len();
                }
                Err(
                    err @ (StoreError::DimensionMismatch { .. }
                    | StoreError::HybridMismatch { .. }),
                ) => {
                    // Schema disagreement is never per-file; abort.
                    return Err(IndexError::Store(err));
                }
                Err(err) => {
                    warn!(path = %file.relative, "indexing failed: {err}");
                    failures.push(FileFailure {
                        path: file.relative.clone(),
                        reason: err.to_string(),
                    });
                }
            }
            reporter.report(
                ProgressEvent::new(IndexPhase::IndexingFiles, (i + 1) as u64, index_total)
                    .with_detail(file.relative.clone()),
            );
        }

        // ---- Verifying ----
        let mut verification = None;
        if inserted_rows > 0 {
            let expected = cache.total_chunks();
            match self.store.verify_inserted(&collection, expected).await {
                Ok(result) => {
                    if !result.is_complete() {
                        let detail = format!(
                            "verification gap: expected {}, observed {}",
                            result.expected, result.observed
                        );
                        warn!("{detail}");
                        if let Some(logger) = &logger {
                            logger.warn(
                                "verification below threshold",
                                Some(serde_json::json!({
                                    "expected": result.expected,
                                    "observed": result.observed,
                                })),
                            );
                        }
                        reporter.report(
                            ProgressEvent::new(IndexPhase::Verifying, 1, 1).with_detail(detail),
                        );
                    } else {
                        reporter.report(ProgressEvent::new(IndexPhase::Verifying, 1, 1));
                    }
                    verification = Some(result);
                }
                Err(err) => {
                    // Verification is advisory; a failed count is not a
                    // failed run.
                    warn!("verification count failed: {err}");
                }
            }
        }

        // ---- Persisting ----
        // Cache first, then metadata: if the cache write fails the
        // metadata must not advance.
        reporter.report(ProgressEvent::new(IndexPhase::Persisting, 0, 2));
        cache.save()?;
        reporter.report(ProgressEvent::new(IndexPhase::Persisting, 1, 2));
        ensure_metadata(
            project_root,
            existing_metadata,
            &collection,
            options,
            &model,
            dimension,
            &cache,
        )?;
        reporter.report(ProgressEvent::new(IndexPhase::Persisting, 2, 2));

        let status = if cancelled || !failures.is_empty() {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };
        let summary = RunSummary {
            indexed_files,
            total_chunks: cache.total_chunks(),
            skipped_unchanged: unchanged,
            deleted: deleted_count,
            failures,
            verification: verification.map(Into::into),
            duration_ms: start.elapsed().as_millis() as u64,
            status,
        };

        reporter.report(ProgressEvent::new(IndexPhase::Done, 0, 0).with_detail(format!(
            "indexed: {}, deleted: {}, unchanged: {}",
            summary.indexed_files, summary.deleted, summary.skipped_unchanged
        )));
        if let Some(logger) = &logger {
            logger.info(
                "indexing run finished",
                serde_json::to_value(&summary).ok(),
            );
        }
        info!(
            indexed = summary.indexed_files,
            deleted = summary.deleted,
            unchanged = summary.skipped_unchanged,
            duration_ms = summary.duration_ms,
            "indexing run finished"
        );
        Ok(summary)
    }

    async fn index_one_file(
        &self,
        collection: &str,
        hybrid: bool,
        file: &FileWork,
    ) -> Result<(), StoreError> {
        self.store
            .delete_by_filter(collection, &FilterExpr::path_equals(&file.relative))
            .await?;
        if file.records.is_empty() {
            return Ok(());
        }
        if hybrid {
            self.store
                .insert_hybrid(collection, file.records.clone())
                .await
        } else {
            self.store.insert(collection, file.records.clone()).await
        }
    }
}

/// Stable chunk id from the chunk's identity tuple. UUIDv5 keeps it both
/// deterministic and acceptable to stores that require UUID point ids.
pub fn chunk_id(
    project_path: &str,
    relative_path: &str,
    start_line: u32,
    end_line: u32,
    content: &str,
) -> String {
    let content_hash = sha256_hex(content.as_bytes());
    let key =
        format!("{project_path}:{relative_path}:{start_line}-{end_line}:{content_hash}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

fn to_record(
    project_key: &str,
    relative: &str,
    extension: &str,
    chunk: SourceChunk,
) -> ChunkRecord {
    let id = chunk_id(
        project_key,
        relative,
        chunk.start_line,
        chunk.end_line,
        &chunk.content,
    );
    let mut metadata = serde_json::json!({ "kind": chunk.kind.as_str() });
    if let Some(language) = Chunker::language_for_extension(extension) {
        metadata["language"] = serde_json::json!(language);
    }
    ChunkRecord {
        id,
        dense_vector: Vec::new(),
        content: chunk.content,
        relative_path: relative.to_string(),
        start_line: chunk.start_line,
        end_line: chunk.end_line,
        file_extension: extension.to_string(),
        metadata,
        sparse_vector: None,
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn extension_of(relative: &str) -> String {
    Path::new(relative)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn file_mtime_ms(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn load_metadata_lenient(project_root: &Path) -> Option<ProjectMetadata> {
    match ProjectMetadata::load(project_root) {
        Ok(meta) => meta,
        Err(err) => {
            warn!("ignoring unreadable project metadata: {err}");
            None
        }
    }
}

/// Write the metadata document, carrying `created_at` over when the
/// collection is unchanged.
#[allow(clippy::too_many_arguments)]
fn ensure_metadata(
    project_root: &Path,
    existing: Option<ProjectMetadata>,
    collection: &str,
    options: &IndexOptions,
    model: &str,
    dimension: usize,
    cache: &HashCache,
) -> Result<(), IndexError> {
    let mut meta = match existing {
        Some(meta) if meta.collection_name == collection => meta,
        _ => ProjectMetadata::new(
            project_root,
            collection.to_string(),
            options.git_identifier.clone(),
            options.hybrid,
            model.to_string(),
            dimension,
        ),
    };
    meta.is_hybrid = options.hybrid;
    meta.embedding_model = model.to_string();
    meta.embedding_dimension = dimension;
    meta.git_repo_identifier = options.git_identifier.clone();
    meta.last_indexed = Some(chrono::Utc::now());
    meta.indexed_file_count = cache.len();
    meta.total_chunks = cache.total_chunks();
    meta.save(project_root)?;
    Ok(())
}

fn open_run_logger(options: &IndexOptions) -> Option<IndexLogger> {
    let result = match &options.logs_dir {
        Some(dir) => {
            let _ = IndexLogger::prune(dir);
            IndexLogger::create_in(dir, &options.project_path)
        }
        None => IndexLogger::create(&options.project_path),
    };
    match result {
        Ok(logger) => Some(logger),
        Err(err) => {
            warn!("run log unavailable: {err}");
            None
        }
    }
}
