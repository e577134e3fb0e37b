//! Embedding providers for vector retrieval and the backfill job.

use crate::error::LlmError;
use crate::llm::{http_client, RetryPolicy};
use async_trait::async_trait;
use psim_core::{CoreConfig, EmbeddingProvider, KnowledgeFragment, PipelineError};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const META_TAG_LIMIT: usize = 3;

/// `topic:.. | availability:.. | emotion:.. | tags:a,b,c`, skipping absent keys.
pub fn compact_metadata(metadata: &Map<String, Value>) -> String {
    let mut parts = Vec::new();
    for (key, label) in [("topic", "topic"), ("availability", "availability"), ("emotion_label", "emotion")] {
        match metadata.get(key) {
            Some(Value::String(s)) if !s.is_empty() => parts.push(format!("{}:{}", label, s)),
            Some(Value::Number(n)) => parts.push(format!("{}:{}", label, n)),
            _ => {}
        }
    }
    if let Some(tags) = metadata.get("tags").and_then(Value::as_array) {
        let tags: Vec<String> = tags
            .iter()
            .take(META_TAG_LIMIT)
            .map(|t| t.as_str().map(str::to_string).unwrap_or_else(|| t.to_string()))
            .collect();
        if !tags.is_empty() {
            parts.push(format!("tags:{}", tags.join(",")));
        }
    }
    parts.join(" | ")
}

/// Fragment text with a compact metadata line appended. The fragment's availability
/// tier is used when its metadata does not carry one.
pub fn fragment_embedding_text(fragment: &KnowledgeFragment) -> String {
    let mut metadata = fragment.metadata.clone();
    metadata
        .entry("availability")
        .or_insert_with(|| Value::String(fragment.availability.as_str().to_string()));
    let meta = compact_metadata(&metadata);
    if meta.is_empty() {
        fragment.text.clone()
    } else {
        format!("{}\nMETA: {}", fragment.text, meta)
    }
}

/// Deterministic feature hashing: sha256 of each lowercase token picks a signed bucket,
/// weighted by token count, then L2-normalised. Needs no model or network.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f64; self.dimensions];
        if self.dimensions == 0 {
            return Vec::new();
        }

        let mut counts: BTreeMap<String, u32> = BTreeMap::new();
        for token in tokenize(text) {
            *counts.entry(token).or_insert(0) += 1;
        }

        for (token, count) in counts {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % self.dimensions;
            let sign = if digest[4] % 2 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign * f64::from(count);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector.into_iter().map(|v| v as f32).collect()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        Ok(self.embed_text(text))
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// OpenAI-compatible `POST {base_url}/embeddings` client.
pub struct HttpEmbedder {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
    retry: RetryPolicy,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model: impl Into<String>, dimensions: usize, timeout: Duration) -> Result<Self, LlmError> {
        Ok(Self {
            http: http_client(timeout)?,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key: None,
            dimensions,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.trim().is_empty());
        self
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }
        let mut parsed: EmbeddingsResponse = response.json().await.map_err(|e| LlmError::Decode(e.to_string()))?;
        parsed.data.sort_by_key(|item| item.index.unwrap_or(usize::MAX));
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| PipelineError::Upstream("embedding endpoint returned no vectors".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.retry.run(|_| self.request(texts)).await?;
        if vectors.len() != texts.len() {
            return Err(PipelineError::Upstream(format!(
                "embedding endpoint returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimensions) {
            return Err(PipelineError::Upstream(format!(
                "embedding dimension {} does not match configured {}",
                bad.len(),
                self.dimensions
            )));
        }
        Ok(vectors)
    }
}

/// Builds the provider named by `embedding.mode` (`hashing` or `http`).
pub fn embedder_from_settings(config: &CoreConfig) -> Result<Arc<dyn EmbeddingProvider>, PipelineError> {
    let settings = &config.embedding;
    match settings.mode.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(settings.dimensions))),
        "http" => {
            let base_url = settings
                .base_url
                .as_deref()
                .ok_or_else(|| PipelineError::BadInput("embedding.base_url is required in http mode".into()))?;
            let model = settings
                .model
                .clone()
                .ok_or_else(|| PipelineError::BadInput("embedding.model is required in http mode".into()))?;
            let timeout = Duration::from_secs_f64(config.llm.timeout_secs.max(0.1));
            let embedder = HttpEmbedder::new(base_url, model, settings.dimensions, timeout)?;
            Ok(Arc::new(embedder.with_api_key(config.llm.api_key.clone())))
        }
        other => Err(PipelineError::BadInput(format!("unknown embedding mode '{}'", other))),
    }
}
