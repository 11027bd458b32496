//! Incremental code indexing and hybrid semantic search.
//!
//! This crate turns a source tree into a queryable collection in a remote
//! vector store and answers natural-language queries against it:
//! - AST-aware chunking via tree-sitter (rust, python, javascript,
//!   typescript, go) with a character-window fallback
//! - incremental indexing keyed by per-file SHA-256 hashes, so unchanged
//!   files cost no embedding calls
//! - batched vectorization through OpenAI-compatible embedding endpoints
//! - dense + lexical-sparse storage in Qdrant (or in memory), fused at
//!   query time with reciprocal rank fusion
//!
//! The interactive surfaces (CLIs, MCP servers) live outside this crate;
//! they drive it through [`IndexController`] and [`SearchEngine`].

pub mod cache;
pub mod chunker;
pub mod embeddings;
pub mod error;
pub mod filter;
pub mod indexer;
pub mod lock;
pub mod logger;
pub mod metadata;
pub mod naming;
pub mod progress;
pub mod retry;
pub mod search;
pub mod sparse;
pub mod store;
pub mod walker;

// Re-exports
pub use cache::{FileHashEntry, HashCache, CONTEXT_DIR};
pub use chunker::{ChunkKind, Chunker, SourceChunk, MAX_CHUNK_CHARS};
pub use embeddings::{
    AuthStyle, Embedding, EmbeddingClient, EmbeddingError, OpenAiCompatClient,
    OpenAiCompatConfig, ResponseShape,
};
pub use error::IndexError;
pub use filter::FilterExpr;
pub use indexer::{
    IndexController, IndexOptions, RunStatus, RunSummary, DEFAULT_EXTENSIONS,
};
pub use metadata::ProjectMetadata;
pub use progress::{ChannelProgress, IndexPhase, NoProgress, ProgressEvent, ProgressReporter};
pub use search::{SearchEngine, SearchError, SearchRequest, SearchResponse};
pub use store::memory::MemoryStore;
pub use store::qdrant::{QdrantConfig, QdrantStore};
pub use store::{
    ChunkRecord, CollectionSchema, ScoredChunk, SearchOptions, StoreError, StoredChunk,
    SubRequest, VectorStore, RRF_K,
};
