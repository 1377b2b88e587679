//! Embedding providers for the optional vector index.
//!
//! Embeddings are fetched from a remote API (OpenAI-compatible or Ollama)
//! and stored as little-endian f32 blobs. With the provider set to
//! `disabled` (the default) the vector backend is simply absent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::config::EmbeddingConfig;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    /// Embed one batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Instantiate the configured provider. Returns `None` when embeddings are
/// disabled; validation of the config happened at load time.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAiProvider::new(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaProvider::new(config)?))),
        other => bail!("unknown embedding provider '{}'", other),
    }
}

/// Embed texts in `batch_size` chunks with retries per chunk.
pub async fn embed_texts(
    provider: &Arc<dyn EmbeddingProvider>,
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for chunk in texts.chunks(config.batch_size.max(1)) {
        let vectors = embed_with_retries(provider, config, chunk).await?;
        if vectors.len() != chunk.len() {
            bail!(
                "provider returned {} vectors for {} inputs",
                vectors.len(),
                chunk.len()
            );
        }
        out.extend(vectors);
    }
    Ok(out)
}

pub async fn embed_query(
    provider: &Arc<dyn EmbeddingProvider>,
    config: &EmbeddingConfig,
    query: &str,
) -> Result<Vec<f32>> {
    let mut vectors = embed_with_retries(provider, config, &[query.to_string()]).await?;
    vectors
        .pop()
        .context("provider returned no vector for query")
}

async fn embed_with_retries(
    provider: &Arc<dyn EmbeddingProvider>,
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let mut attempt: u32 = 0;
    loop {
        match provider.embed(texts).await {
            Ok(vectors) => return Ok(vectors),
            Err(e) if attempt < config.max_retries => {
                attempt += 1;
                let backoff = Duration::from_millis(500u64 << attempt.min(6));
                warn!(attempt, error = %e, "embedding request failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

struct OpenAiProvider {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAiProvider {
    fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY must be set for the openai embedding provider")?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Ok(OpenAiProvider {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            url: format!("{}/embeddings", base.trim_end_matches('/')),
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            dims: config.dims.unwrap_or(1536),
        })
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .context("sending embedding request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("embedding API returned {}: {}", status, body);
        }
        let parsed: OpenAiResponse = resp.json().await.context("parsing embedding response")?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

struct OllamaProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaProvider {
    fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(OllamaProvider {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            url: format!("{}/api/embed", base.trim_end_matches('/')),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            dims: config.dims.unwrap_or(768),
        })
    }
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .context("sending embedding request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("embedding API returned {}: {}", status, body);
        }
        let parsed: OllamaResponse = resp.json().await.context("parsing embedding response")?;
        Ok(parsed.embeddings)
    }
}

pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
