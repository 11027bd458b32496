//! Embedding client trait and the OpenAI-compatible HTTP provider.
//!
//! The provider speaks the `POST {base_url}/embeddings` protocol shared by
//! OpenAI, Azure OpenAI, and the DashScope-compatible endpoints. Provider
//! quirks are captured as enumerated options rather than separate clients:
//! auth header style, response vector field, a per-request batch ceiling,
//! and Matryoshka-style custom dimensions.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::retry::{with_backoff, Recoverable, RetryPolicy};

/// One embedded text.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub dimension: usize,
}

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("provider error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed embedding response: {0}")]
    MalformedResponse(String),

    #[error("embedding dimension {actual} does not match expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl Recoverable for EmbeddingError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::RateLimited | Self::Timeout(_) | Self::Network(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Auth(_) | Self::MalformedResponse(_) | Self::DimensionMismatch { .. } => false,
        }
    }
}

/// Capability surface of a vectorizer.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    /// Embed many texts, preserving input order. The result length always
    /// equals the input length.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError>;

    /// Issue one probe call and return (and remember) the vector length.
    async fn detect_dimension(&self, probe_text: &str) -> Result<usize, EmbeddingError>;

    /// Last known dimension: a configured override, a known-model lookup,
    /// or a previously detected value.
    fn get_dimension(&self) -> Option<usize>;

    /// Model identifier sent to the provider.
    fn model_name(&self) -> &str;

    /// Provider-imposed maximum inputs per request, if any.
    fn batch_ceiling(&self) -> Option<usize> {
        None
    }
}

/// How the API key travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` (OpenAI and compatibles).
    Bearer,
    /// `api-key: <key>` (Azure; deployment and api-version live in the URL).
    ApiKeyHeader,
}

/// Which field of each response item carries the vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// `data[].embedding`
    OpenAi,
    /// `data[].vector`
    Alibaba,
}

/// Configuration for [`OpenAiCompatClient`].
#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    /// Endpoint base; the client posts to `{base_url}/embeddings`.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub auth_style: AuthStyle,
    pub response_shape: ResponseShape,
    /// Provider batch ceiling; requests are split transparently.
    /// The DashScope-compatible endpoint caps at 10.
    pub batch_ceiling: Option<usize>,
    /// Matryoshka dimension override, passed through as `dimensions`.
    pub custom_dimension: Option<usize>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OpenAiCompatConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "text-embedding-3-small".to_string(),
            auth_style: AuthStyle::Bearer,
            response_shape: ResponseShape::OpenAi,
            batch_ceiling: None,
            custom_dimension: None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Dimensions of models whose output size is fixed and known, so the
/// probe call can be skipped.
fn known_model_dimension(model: &str) -> Option<usize> {
    static TABLE: OnceLock<HashMap<&'static str, usize>> = OnceLock::new();
    TABLE
        .get_or_init(|| {
            HashMap::from([
                ("text-embedding-3-small", 1536),
                ("text-embedding-3-large", 3072),
                ("text-embedding-ada-002", 1536),
                ("text-embedding-v3", 1024),
                ("text-embedding-v4", 1024),
            ])
        })
        .get(model)
        .copied()
}

/// HTTP embedding client for OpenAI-compatible endpoints.
#[derive(Debug)]
pub struct OpenAiCompatClient {
    config: OpenAiCompatConfig,
    client: reqwest::Client,
    detected: OnceLock<usize>,
}

#[derive(Deserialize)]
struct ApiResponse {
    data: Vec<ApiItem>,
}

#[derive(Deserialize)]
struct ApiItem {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    vector: Option<Vec<f32>>,
}

impl OpenAiCompatClient {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, EmbeddingError> {
        if config.api_key.is_empty() {
            return Err(EmbeddingError::Auth("no API key configured".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EmbeddingError::Network(e.to_string()))?;
        Ok(Self {
            config,
            client,
            detected: OnceLock::new(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.config.base_url.trim_end_matches('/'))
    }

    /// One wire request for at most `batch_ceiling` inputs.
    async fn request_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let mut body = json!({
            "model": self.config.model,
            "input": texts,
            "encoding_format": "float",
        });
        if let Some(dim) = self.config.custom_dimension {
            body["dimensions"] = json!(dim);
        }

        let send = || async {
            let mut request = self.client.post(self.endpoint()).json(&body);
            request = match self.config.auth_style {
                AuthStyle::Bearer => request.bearer_auth(&self.config.api_key),
                AuthStyle::ApiKeyHeader => request.header("api-key", &self.config.api_key),
            };

            let response = request.send().await.map_err(classify_reqwest)?;
            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(classify_status(status.as_u16(), message));
            }

            let parsed: ApiResponse = response
                .json()
                .await
                .map_err(|e| EmbeddingError::MalformedResponse(e.to_string()))?;
            self.extract_vectors(parsed, texts.len())
        };

        with_backoff(&self.config.retry, send).await
    }

    fn extract_vectors(
        &self,
        response: ApiResponse,
        expected_len: usize,
    ) -> Result<Vec<Embedding>, EmbeddingError> {
        if response.data.len() != expected_len {
            return Err(EmbeddingError::MalformedResponse(format!(
                "expected {expected_len} items, got {}",
                response.data.len()
            )));
        }

        // Providers may return items out of order; the index field wins
        // when present.
        let mut items: Vec<(usize, ApiItem)> = response
            .data
            .into_iter()
            .enumerate()
            .map(|(i, item)| (item.index.unwrap_or(i), item))
            .collect();
        items.sort_by_key(|(idx, _)| *idx);

        let mut embeddings = Vec::with_capacity(expected_len);
        for (_, item) in items {
            let vector = match self.config.response_shape {
                ResponseShape::OpenAi => item.embedding,
                ResponseShape::Alibaba => item.vector,
            }
            .ok_or_else(|| {
                EmbeddingError::MalformedResponse(format!(
                    "item missing {} field",
                    match self.config.response_shape {
                        ResponseShape::OpenAi => "embedding",
                        ResponseShape::Alibaba => "vector",
                    }
                ))
            })?;

            if let Some(expected) = self.config.custom_dimension {
                if vector.len() != expected {
                    return Err(EmbeddingError::DimensionMismatch {
                        expected,
                        actual: vector.len(),
                    });
                }
            }

            let dimension = vector.len();
            embeddings.push(Embedding { vector, dimension });
        }
        Ok(embeddings)
    }
}

fn classify_reqwest(err: reqwest::Error) -> EmbeddingError {
    if err.is_timeout() {
        EmbeddingError::Timeout(err.to_string())
    } else {
        EmbeddingError::Network(err.to_string())
    }
}

fn classify_status(status: u16, message: String) -> EmbeddingError {
    match status {
        401 | 403 => EmbeddingError::Auth(message),
        429 => EmbeddingError::RateLimited,
        408 => EmbeddingError::Timeout(message),
        _ => EmbeddingError::Api { status, message },
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiCompatClient {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let texts = [text.to_string()];
        let mut result = self.embed_batch(&texts).await?;
        result
            .pop()
            .ok_or_else(|| EmbeddingError::MalformedResponse("empty response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let ceiling = self.config.batch_ceiling.unwrap_or(texts.len()).max(1);
        let mut all = Vec::with_capacity(texts.len());
        for sub in texts.chunks(ceiling) {
            debug!(batch = sub.len(), model = %self.config.model, "embedding batch");
            let embeddings = self.request_batch(sub).await?;
            all.extend(embeddings);
        }

        // Remember the observed dimension for later get_dimension calls.
        if let Some(first) = all.first() {
            let _ = self.detected.set(first.dimension);
        }
        Ok(all)
    }

    async fn detect_dimension(&self, probe_text: &str) -> Result<usize, EmbeddingError> {
        if let Some(dim) = self.detected.get() {
            return Ok(*dim);
        }
        let embedding = self.embed(probe_text).await?;
        let _ = self.detected.set(embedding.dimension);
        debug!(dimension = embedding.dimension, "detected embedding dimension");
        Ok(embedding.dimension)
    }

    fn get_dimension(&self) -> Option<usize> {
        self.config
            .custom_dimension
            .or_else(|| known_model_dimension(&self.config.model))
            .or_else(|| self.detected.get().copied())
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn batch_ceiling(&self) -> Option<usize> {
        self.config.batch_ceiling
    }
}

/// Resolve the authoritative dimension: the client's known value, or a
/// probe call when nothing is known yet.
pub async fn resolve_dimension(
    client: &dyn EmbeddingClient,
) -> Result<usize, EmbeddingError> {
    if let Some(dim) = client.get_dimension() {
        return Ok(dim);
    }
    warn!(
        model = client.model_name(),
        "dimension unknown, probing the provider"
    );
    client.detect_dimension("dimension probe").await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with(config: OpenAiCompatConfig) -> OpenAiCompatClient {
        OpenAiCompatClient::new(OpenAiCompatConfig {
            api_key: "test-key".to_string(),
            ..config
        })
        .unwrap()
    }

    fn response(items: Vec<serde_json::Value>) -> ApiResponse {
        serde_json::from_value(json!({ "data": items })).unwrap()
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let err = OpenAiCompatClient::new(OpenAiCompatConfig::default()).unwrap_err();
        assert!(matches!(err, EmbeddingError::Auth(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn known_model_dimensions() {
        assert_eq!(known_model_dimension("text-embedding-3-small"), Some(1536));
        assert_eq!(known_model_dimension("text-embedding-3-large"), Some(3072));
        assert_eq!(known_model_dimension("some-unknown-model"), None);
    }

    #[test]
    fn custom_dimension_wins_over_model_table() {
        let client = client_with(OpenAiCompatConfig {
            custom_dimension: Some(256),
            ..Default::default()
        });
        assert_eq!(client.get_dimension(), Some(256));
    }

    #[test]
    fn unknown_model_has_no_dimension_until_detected() {
        let client = client_with(OpenAiCompatConfig {
            model: "mystery-embedder".to_string(),
            ..Default::default()
        });
        assert_eq!(client.get_dimension(), None);
        client.detected.set(768).unwrap();
        assert_eq!(client.get_dimension(), Some(768));
    }

    #[test]
    fn openai_shape_reads_embedding_field() {
        let client = client_with(OpenAiCompatConfig::default());
        let parsed = response(vec![
            json!({"index": 0, "embedding": [0.1, 0.2]}),
            json!({"index": 1, "embedding": [0.3, 0.4]}),
        ]);
        let out = client.extract_vectors(parsed, 2).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].vector, vec![0.1, 0.2]);
        assert_eq!(out[0].dimension, 2);
    }

    #[test]
    fn alibaba_shape_reads_vector_field() {
        let client = client_with(OpenAiCompatConfig {
            response_shape: ResponseShape::Alibaba,
            ..Default::default()
        });
        let parsed = response(vec![json!({"vector": [1.0, 2.0, 3.0]})]);
        let out = client.extract_vectors(parsed, 1).unwrap();
        assert_eq!(out[0].vector, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn wrong_field_is_malformed() {
        let client = client_with(OpenAiCompatConfig {
            response_shape: ResponseShape::Alibaba,
            ..Default::default()
        });
        let parsed = response(vec![json!({"embedding": [1.0]})]);
        let err = client.extract_vectors(parsed, 1).unwrap_err();
        assert!(matches!(err, EmbeddingError::MalformedResponse(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn out_of_order_items_are_reordered() {
        let client = client_with(OpenAiCompatConfig::default());
        let parsed = response(vec![
            json!({"index": 1, "embedding": [2.0]}),
            json!({"index": 0, "embedding": [1.0]}),
        ]);
        let out = client.extract_vectors(parsed, 2).unwrap();
        assert_eq!(out[0].vector, vec![1.0]);
        assert_eq!(out[1].vector, vec![2.0]);
    }

    #[test]
    fn custom_dimension_mismatch_is_fatal() {
        let client = client_with(OpenAiCompatConfig {
            custom_dimension: Some(4),
            ..Default::default()
        });
        let parsed = response(vec![json!({"embedding": [1.0, 2.0]})]);
        let err = client.extract_vectors(parsed, 1).unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch { expected: 4, actual: 2 }
        ));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn item_count_mismatch_is_malformed() {
        let client = client_with(OpenAiCompatConfig::default());
        let parsed = response(vec![json!({"embedding": [1.0]})]);
        assert!(client.extract_vectors(parsed, 3).is_err());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(classify_status(401, String::new()), EmbeddingError::Auth(_)));
        assert!(matches!(classify_status(429, String::new()), EmbeddingError::RateLimited));
        assert!(classify_status(429, String::new()).is_recoverable());
        assert!(classify_status(503, String::new()).is_recoverable());
        assert!(!classify_status(400, String::new()).is_recoverable());
    }

    #[tokio::test]
    async fn embed_batch_empty_input() {
        let client = client_with(OpenAiCompatConfig::default());
        let out = client.embed_batch(&[]).await.unwrap();
        assert!(out.is_empty());
    }
}
