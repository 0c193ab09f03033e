//! Embedding providers.
//!
//! | Provider   | Backend                                      | Sparse |
//! |------------|----------------------------------------------|--------|
//! | `hash`     | [`HashEmbedder`], local feature hashing       | yes    |
//! | `openai`   | `POST https://api.openai.com/v1/embeddings`  | no     |
//! | `ollama`   | `POST {url}/api/embed`                       | no     |
//! | `disabled` | none; vector search is unavailable           |        |
//!
//! Remote providers batch inputs into one request and retry through
//! [`JsonEndpoint`]. Every returned vector is checked against the
//! configured dimensionality.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use viking_store_core::embedding::{EmbedResult, Embedder, HashEmbedder};

use crate::config::{Config, EmbeddingProviderKind};
use crate::http::{endpoint_url, openai_api_key, JsonEndpoint, OLLAMA_DEFAULT_URL};

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// Build the configured embedder. `None` when embedding is disabled.
pub fn create_embedder(config: &Config) -> Result<Option<Arc<dyn Embedder>>> {
    let dims = config.embedding.dims.unwrap_or(config.vectordb.dims);
    let embedder: Arc<dyn Embedder> = match config.embedding.provider {
        EmbeddingProviderKind::Disabled => return Ok(None),
        EmbeddingProviderKind::Hash => Arc::new(HashEmbedder::new(dims)),
        EmbeddingProviderKind::OpenAI => Arc::new(OpenAIEmbedder::new(config, dims)?),
        EmbeddingProviderKind::Ollama => Arc::new(OllamaEmbedder::new(config, dims)?),
    };
    Ok(Some(embedder))
}

fn required_model(config: &Config) -> Result<String> {
    config.embedding.model.clone().ok_or_else(|| {
        anyhow::anyhow!(
            "embedding.model required for {:?} provider",
            config.embedding.provider
        )
    })
}

fn dense_results(vectors: Vec<Vec<f32>>, expected: usize, dims: usize) -> Result<Vec<EmbedResult>> {
    if vectors.len() != expected {
        bail!(
            "embedding response has {} vectors for {} inputs",
            vectors.len(),
            expected
        );
    }
    vectors
        .into_iter()
        .map(|v| {
            if v.len() != dims {
                bail!("embedding has {} dims, expected {}", v.len(), dims);
            }
            Ok(EmbedResult {
                dense: Some(v),
                sparse: None,
            })
        })
        .collect()
}

fn float_array(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|a| a.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

/// OpenAI embeddings API client. Requires `OPENAI_API_KEY`.
pub struct OpenAIEmbedder {
    endpoint: JsonEndpoint,
    model: String,
    dims: usize,
}

impl OpenAIEmbedder {
    pub fn new(config: &Config, dims: usize) -> Result<Self> {
        let model = required_model(config)?;
        let url = config
            .embedding
            .url
            .clone()
            .unwrap_or_else(|| OPENAI_EMBEDDINGS_URL.to_string());
        let endpoint = JsonEndpoint::new(
            "OpenAI",
            url,
            Some(openai_api_key()?),
            Duration::from_secs(config.embedding.timeout_secs),
            config.embedding.max_retries,
        )?;
        Ok(Self {
            endpoint,
            model,
            dims,
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

    async fn embed(&self, text: &str) -> Result<EmbedResult> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        Ok(out.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbedResult>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
        });
        let response = self.endpoint.post(&body).await?;
        dense_results(parse_openai_response(&response)?, texts.len(), self.dims)
    }
}

/// `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(float_array)
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, embedding));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Local Ollama instance, `POST /api/embed`.
pub struct OllamaEmbedder {
    endpoint: JsonEndpoint,
    model: String,
    dims: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &Config, dims: usize) -> Result<Self> {
        let model = required_model(config)?;
        let base = config
            .embedding
            .url
            .as_deref()
            .unwrap_or(OLLAMA_DEFAULT_URL);
        let endpoint = JsonEndpoint::new(
            "Ollama",
            endpoint_url(base, "/api/embed"),
            None,
            Duration::from_secs(config.embedding.timeout_secs),
            config.embedding.max_retries,
        )?;
        Ok(Self {
            endpoint,
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<EmbedResult> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        Ok(out.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbedResult>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "model": self.model,
            "input": texts,
        });
        let response = self.endpoint.post(&body).await?;
        dense_results(parse_ollama_response(&response)?, texts.len(), self.dims)
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|e| {
            float_array(e)
                .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}
