//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: always fails; used when embeddings are not configured.
//! - **[`HashProvider`]**: deterministic feature hashing, fully offline.
//! - **[`OpenAIProvider`]**: OpenAI embeddings API with retry and backoff.
//! - **[`OllamaProvider`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalProvider`**: fastembed inference (feature `local-embeddings-fastembed`).
//!
//! Also provides vector utilities:
//! - [`embed_documents`]: chunked, mean-pooled embedding of long texts
//! - [`cosine_similarity`]: similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian `f32` BLOB encoding
//!
//! # Retry Strategy
//!
//! The HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::chunk::chunk_text;
use crate::config::EmbeddingConfig;
use crate::error::EmbedError;

/// A text → vector model.
///
/// Implementations must be deterministic for a given model version: the same
/// input text always produces the same vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts. The output has one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Embed a single text.
pub async fn embed_one(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>, EmbedError> {
    provider
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| EmbedError::InvalidResponse("empty embedding response".into()))
}

/// Embed whole documents, one vector per input text.
///
/// Texts longer than `max_input_chars` are split with [`chunk_text`]; the
/// chunk vectors are mean-pooled and L2-normalized. Requests carry at most
/// `batch_size` texts.
pub async fn embed_documents(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    max_input_chars: usize,
    batch_size: usize,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    let mut pieces: Vec<String> = Vec::new();
    let mut spans = Vec::with_capacity(texts.len());
    for text in texts {
        let chunks = chunk_text(text, max_input_chars);
        spans.push(chunks.len());
        pieces.extend(chunks.into_iter().map(String::from));
    }

    let mut vectors = Vec::with_capacity(pieces.len());
    for batch in pieces.chunks(batch_size.max(1)) {
        vectors.extend(check_batch(batch.len(), provider.embed(batch).await?)?);
    }

    let mut vectors = vectors.into_iter();
    spans
        .into_iter()
        .map(|n| mean_pool(vectors.by_ref().take(n).collect()))
        .collect()
}

/// Embed a single document. See [`embed_documents`].
pub async fn embed_document(
    provider: &dyn EmbeddingProvider,
    text: &str,
    max_input_chars: usize,
) -> Result<Vec<f32>, EmbedError> {
    embed_documents(provider, &[text.to_string()], max_input_chars, 1)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| EmbedError::InvalidResponse("empty embedding response".into()))
}

/// Component-wise mean of chunk vectors, L2-normalized. A single vector is
/// returned unchanged.
fn mean_pool(mut vectors: Vec<Vec<f32>>) -> Result<Vec<f32>, EmbedError> {
    if vectors.len() <= 1 {
        return vectors
            .pop()
            .ok_or_else(|| EmbedError::InvalidResponse("empty embedding response".into()));
    }
    let dims = vectors[0].len();
    if vectors.iter().any(|v| v.len() != dims) {
        return Err(EmbedError::InvalidResponse(
            "chunk embeddings differ in length".into(),
        ));
    }

    let mut pooled = vec![0.0f32; dims];
    for v in &vectors {
        for (acc, x) in pooled.iter_mut().zip(v) {
            *acc += x;
        }
    }
    let norm = pooled.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        pooled.iter_mut().for_each(|x| *x /= norm);
    }
    Ok(pooled)
}

fn check_batch(expected: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>, EmbedError> {
    if vectors.len() != expected {
        return Err(EmbedError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            expected,
            vectors.len()
        )));
    }
    Ok(vectors)
}

// ============ Disabled Provider ============

/// Provider used when `embedding.provider = "disabled"`. Every call fails.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Err(EmbedError::ModelUnavailable(
            "embedding provider is disabled".into(),
        ))
    }
}

// ============ Hash Provider ============

/// Feature-hashing embedder.
///
/// Lowercase alphanumeric tokens are hashed (FNV-1a) into `dims` buckets
/// with sublinear term weighting, then L2-normalized. Texts sharing
/// vocabulary get a positive cosine similarity. Needs no model download or
/// network, which makes it the provider for offline corpora and tests.
pub struct HashProvider {
    model: String,
    dims: usize,
}

impl HashProvider {
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut counts = vec![0u32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = (fnv1a(&token.to_lowercase()) % self.dims as u64) as usize;
            counts[bucket] += 1;
        }

        let mut v: Vec<f32> = counts
            .into_iter()
            .map(|c| if c == 0 { 0.0 } else { 1.0 + (c as f32).ln() })
            .collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

// ============ HTTP providers ============

struct HttpSettings {
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpSettings {
    fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_retries: config.max_retries,
        })
    }

    /// POST `body` to `url`, retrying on 429, 5xx and network errors.
    async fn post_json(
        &self,
        label: &str,
        url: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, EmbedError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(label, attempt, ?delay, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.post(url).json(body);
            if let Some(key) = bearer {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response.json().await.map_err(|e| {
                            EmbedError::InvalidResponse(format!("{} response body: {}", label, e))
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = EmbedError::ModelUnavailable(format!(
                        "{} API error {}: {}",
                        label, status, body_text
                    ));
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(EmbedError::ModelUnavailable(format!(
                        "{} connection error ({}): {}",
                        label, url, e
                    )));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            EmbedError::ModelUnavailable(format!("{} embedding failed after retries", label))
        }))
    }
}

fn json_vector(value: &serde_json::Value, label: &str) -> Result<Vec<f32>, EmbedError> {
    value
        .as_array()
        .ok_or_else(|| EmbedError::InvalidResponse(format!("{}: embedding is not an array", label)))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbedError::InvalidResponse(format!("{}: non-numeric component", label)))
        })
        .collect()
}

/// Embedding provider using the OpenAI API.
///
/// Calls `POST /v1/embeddings` (or `embedding.url` for compatible servers).
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    http: HttpSettings,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(k) => k,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1/embeddings".to_string());

        Ok(Self {
            model,
            dims,
            url,
            api_key,
            http: HttpSettings::new(config)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = self
            .http
            .post_json("OpenAI", &self.url, Some(&self.api_key), &body)
            .await?;
        check_batch(texts.len(), parse_openai_response(&json)?)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbedError::InvalidResponse("OpenAI: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| EmbedError::InvalidResponse("OpenAI: missing embedding".into()))?;
        indexed.push((index, json_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on `embedding.url` (default `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    http: HttpSettings,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url,
            http: HttpSettings::new(config)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let endpoint = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let json = self.http.post_json("Ollama", &endpoint, None, &body).await?;
        check_batch(texts.len(), parse_ollama_response(&json)?)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbedError::InvalidResponse("Ollama: missing embeddings array".into()))?
        .iter()
        .map(|e| json_vector(e, "Ollama"))
        .collect()
}

// ============ Local Provider (fastembed) ============

/// Local inference via fastembed. The model is downloaded from Hugging Face
/// on first use and cached; afterwards no network calls are made.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (fastembed_model, default_dims) = fastembed_model(&model_name)?;
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        Ok(Self {
            model_name,
            dims: config.dims.unwrap_or(default_dims),
            batch_size: config.batch_size,
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    use fastembed::EmbeddingModel as M;
    Ok(match name {
        "all-minilm-l6-v2" => (M::AllMiniLML6V2, 384),
        "bge-small-en-v1.5" => (M::BGESmallENV15, 384),
        "bge-base-en-v1.5" => (M::BGEBaseENV15, 768),
        "bge-large-en-v1.5" => (M::BGELargeENV15, 1024),
        "nomic-embed-text-v1.5" => (M::NomicEmbedTextV15, 768),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5",
            other
        ),
    })
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        let expected = texts.len();
        let batch_size = self.batch_size;

        let vectors = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|e| EmbedError::ModelUnavailable(format!("model lock poisoned: {}", e)))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| EmbedError::ModelUnavailable(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| EmbedError::ModelUnavailable(format!("embedding task failed: {}", e)))??;

        check_batch(expected, vectors)
    }
}

/// Create the [`EmbeddingProvider`] named by `embedding.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"hash"` | [`HashProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings-fastembed`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "hash" => {
            let dims = config
                .dims
                .filter(|d| *d > 0)
                .ok_or_else(|| anyhow::anyhow!("embedding.dims required for hash provider"))?;
            let model = config
                .model
                .clone()
                .unwrap_or_else(|| format!("hash-{}", dims));
            Ok(Arc::new(HashProvider::new(model, dims)))
        }
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as a BLOB of little-endian `f32` bytes.
///
/// ```rust
/// use docket::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), Some(v));
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`]. Returns `None` when the length
/// is not a multiple of four.
pub fn blob_to_vec(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

/// Cosine similarity between two vectors, in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or
/// zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
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
