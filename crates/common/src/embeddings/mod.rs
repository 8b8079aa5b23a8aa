//! Embedding service abstraction
//!
//! Provides a unified interface over remote embedding providers:
//! - OpenAI-compatible endpoints (OpenAI, DashScope, self-hosted)
//! - A deterministic mock for tests
//!
//! Failures are split into transient (retried here with exponential backoff
//! and jitter) and fatal (propagated). The embedding dimension is fixed per
//! deployment; a provider returning a different dimension is fatal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingConfig;
use crate::errors::{AppError, Result};
use crate::metrics::record_embedding;

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embeddings for a batch of texts. Callers may pass any
    /// number of texts; implementations split into provider-sized batches.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;
}

/// OpenAI-compatible embedding client
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimension: usize,
    base_url: String,
    batch_max: usize,
    max_retries: u32,
}

#[derive(Serialize)]
struct EmbeddingRequest {
    input: Vec<String>,
    model: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, base_url: String) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AppError::Configuration {
                message: format!("embedding provider '{}' requires an API key", config.provider),
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            dimension: config.dimension,
            base_url,
            batch_max: config.batch_max.max(1),
            max_retries: config.max_retries,
        })
    }

    /// One provider call with transient/fatal classification.
    async fn make_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);

        let request = EmbeddingRequest {
            input: texts.to_vec(),
            model: self.model.clone(),
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::EmbedTransient {
                message: format!("request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // 429 and 5xx are worth retrying; other 4xx are not.
            let message = format!("API error {status}: {body}");
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(AppError::EmbedTransient { message })
            } else {
                Err(AppError::EmbedFatal { message })
            };
        }

        let result: EmbeddingResponse =
            response.json().await.map_err(|e| AppError::EmbedTransient {
                message: format!("failed to parse response: {e}"),
            })?;

        let embeddings: Vec<Vec<f32>> = result.data.into_iter().map(|d| d.embedding).collect();

        if embeddings.len() != texts.len() {
            return Err(AppError::EmbedFatal {
                message: format!(
                    "provider returned {} embeddings for {} inputs",
                    embeddings.len(),
                    texts.len()
                ),
            });
        }
        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.dimension) {
            return Err(AppError::EmbedFatal {
                message: format!(
                    "dimension mismatch: expected {}, provider returned {}",
                    self.dimension,
                    bad.len()
                ),
            });
        }

        Ok(embeddings)
    }

    /// Retry transient failures with exponential backoff and jitter.
    async fn request_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let base = 100u64 * 2u64.pow(attempt - 1);
                let jitter = rand::thread_rng().gen_range(0..=base / 2);
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
            }

            let started = Instant::now();
            match self.make_request(texts).await {
                Ok(embeddings) => {
                    record_embedding(started.elapsed().as_secs_f64(), &self.model, true);
                    return Ok(embeddings);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        error = %e,
                        "Embedding request failed, retrying"
                    );
                    record_embedding(started.elapsed().as_secs_f64(), &self.model, false);
                    last_error = Some(e);
                }
                Err(e) => {
                    record_embedding(started.elapsed().as_secs_f64(), &self.model, false);
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::EmbedTransient {
            message: "unknown error after retries".to_string(),
        }))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all_embeddings = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_max) {
            let embeddings = self.request_with_retry(batch).await?;
            all_embeddings.extend(embeddings);
        }

        Ok(all_embeddings)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic mock embedder for tests.
///
/// Embeds text as a hashed bag-of-words unit vector, so identical texts map
/// to identical vectors and texts sharing terms score a meaningful cosine
/// similarity.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hash: u64 = 0xcbf29ce484222325;
            for b in token.to_lowercase().bytes() {
                hash ^= b as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
            v[(hash % self.dimension as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

const OPENAI_BASE: &str = "https://api.openai.com/v1";
const DASHSCOPE_BASE: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// Create an embedder from configuration.
///
/// Fails at startup on unknown providers or missing endpoints rather than
/// degrading silently.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => {
            let base = config.api_base.clone().unwrap_or_else(|| OPENAI_BASE.to_string());
            Ok(Arc::new(OpenAiEmbedder::new(config, base)?))
        }
        "dashscope" => {
            let base = config
                .api_base
                .clone()
                .unwrap_or_else(|| DASHSCOPE_BASE.to_string());
            Ok(Arc::new(OpenAiEmbedder::new(config, base)?))
        }
        "custom" => {
            let base = config.api_base.clone().ok_or_else(|| AppError::Configuration {
                message: "embedding provider 'custom' requires api_base".to_string(),
            })?;
            Ok(Arc::new(OpenAiEmbedder::new(config, base)?))
        }
        "mock" => Ok(Arc::new(MockEmbedder::new(config.dimension))),
        other => Err(AppError::Configuration {
            message: format!("unknown embedding provider: {other}"),
        }),
    }
}
