//! Embedding providers.
//!
//! Concrete [`Embedder`] implementations selected by `embedding.provider`:
//!
//! | Config Value | Provider |
//! |-------------|----------|
//! | `"disabled"` | [`DisabledEmbedder`]: every call fails |
//! | `"hash"` | [`HashEmbedder`]: deterministic feature hashing, no network |
//! | `"openai"` | [`OpenAIEmbedder`] against `api.openai.com` |
//! | `"ollama"` | [`OpenAIEmbedder`] against a local OpenAI-compatible server |
//!
//! Retrieval degrades to "no grounding" when the embedder fails, so a
//! disabled provider still yields answers (just ungrounded ones).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use persona_harness_core::embedding::{normalize, Embedder};

use crate::config::EmbeddingConfig;
use crate::http;

// ============ Disabled ============

/// Embedder used when `embedding.provider = "disabled"`.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ Hash ============

/// Bag-of-words feature hashing into a fixed number of dimensions.
///
/// Each lower-cased alphanumeric token is hashed with SHA-256; the first
/// eight bytes pick a bucket and the ninth picks a sign. The result is
/// L2-normalized, so texts sharing vocabulary have positive cosine
/// similarity. Useful offline and in tests; not a semantic model.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vec[index] += sign;
        }
        normalize(&mut vec);
        vec
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

// ============ OpenAI-compatible ============

/// Calls `POST {url}/embeddings` on an OpenAI-compatible API.
pub struct OpenAIEmbedder {
    provider: String,
    model: String,
    dims: usize,
    url: String,
    api_key: Option<String>,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for {} provider", config.provider))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for {} provider", config.provider))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| http::default_base_url(&config.provider).to_string());

        Ok(Self {
            provider: config.provider.clone(),
            model,
            dims,
            url: format!("{}/embeddings", base.trim_end_matches('/')),
            api_key: http::api_key(&config.provider)?,
            max_retries: config.max_retries,
            client: http::client(Duration::from_secs(config.timeout_secs))?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let json = http::post_json(
            &self.client,
            &self.provider,
            &self.url,
            self.api_key.as_deref(),
            &body,
            self.max_retries,
        )
        .await?;
        let vec = parse_embedding_response(&json)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty embedding response"))?;
        if vec.len() != self.dims {
            bail!(
                "{} returned {} dimensions, expected {}",
                self.model,
                vec.len(),
                self.dims
            );
        }
        Ok(vec)
    }
}

/// Extract `data[].embedding` arrays, ordered by `index` when present.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid embedding response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid embedding response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Create the configured [`Embedder`].
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dims.unwrap_or(256)))),
        "openai" | "ollama" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
