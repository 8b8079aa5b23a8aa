//! Rerankers.
//!
//! The remote client speaks the common cross-encoder rerank API shape
//! (query + documents in, scores out). The builtin overlap scorer keeps
//! deployments without a rerank service (and the test suite) working.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use corpusforge_common::config::RetrievalConfig;
use corpusforge_common::errors::{AppError, Result};

use super::lexical::prepare_terms;

/// Scores candidate passages against a query; higher is more relevant.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;

    fn model_name(&self) -> &str;
}

/// Term-overlap scorer: the fraction of query terms present in the
/// passage, dampened by passage length. Deterministic and dependency-free.
#[derive(Default)]
pub struct OverlapReranker;

#[async_trait]
impl Reranker for OverlapReranker {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let terms = prepare_terms(query);
        if terms.is_empty() {
            return Ok(vec![0.0; documents.len()]);
        }

        Ok(documents
            .iter()
            .map(|doc| {
                let haystack = doc.to_lowercase();
                let matched = terms
                    .iter()
                    .filter(|t| haystack.contains(&t.to_lowercase()))
                    .count();
                let coverage = matched as f32 / terms.len() as f32;
                let length_damp = 1.0 / (1.0 + (doc.len() as f32 / 2048.0));
                coverage * (0.75 + 0.25 * length_damp)
            })
            .collect())
    }

    fn model_name(&self) -> &str {
        "builtin-overlap"
    }
}

/// Remote cross-encoder client.
pub struct RemoteReranker {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResultItem>,
}

#[derive(Deserialize)]
struct RerankResultItem {
    index: usize,
    relevance_score: f32,
}

impl RemoteReranker {
    pub fn new(model: String, base_url: String, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl Reranker for RemoteReranker {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let url = format!("{}/rerank", self.base_url);
        let mut request = self.client.post(&url).json(&RerankRequest {
            model: &self.model,
            query,
            documents,
        });
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| AppError::RerankError {
            message: format!("request failed: {e}"),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::RerankError {
                message: format!("API error {status}: {body}"),
            });
        }

        let parsed: RerankResponse = response.json().await.map_err(|e| AppError::RerankError {
            message: format!("failed to parse response: {e}"),
        })?;

        let mut scores = vec![0.0f32; documents.len()];
        for item in parsed.results {
            if item.index < scores.len() {
                scores[item.index] = item.relevance_score;
            }
        }
        Ok(scores)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Build the configured reranker.
pub fn create_reranker(config: &RetrievalConfig) -> Result<Arc<dyn Reranker>> {
    match config.rerank_model.as_str() {
        "builtin" => Ok(Arc::new(OverlapReranker)),
        model => {
            let base = config
                .rerank_api_base
                .clone()
                .ok_or_else(|| AppError::Configuration {
                    message: format!("rerank model '{model}' requires rerank_api_base"),
                })?;
            Ok(Arc::new(RemoteReranker::new(
                model.to_string(),
                base,
                config.rerank_api_key.clone(),
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overlap_reranker_orders_by_coverage() {
        let reranker = OverlapReranker;
        let docs = vec![
            "Milvus supports HNSW index structures".to_string(),
            "completely unrelated passage".to_string(),
            "an index of something".to_string(),
        ];
        let scores = reranker.score("HNSW index", &docs).await.unwrap();
        assert!(scores[0] > scores[2]);
        assert!(scores[2] > scores[1]);
        assert_eq!(scores[1], 0.0);
    }

    #[tokio::test]
    async fn test_overlap_reranker_empty_query() {
        let reranker = OverlapReranker;
        let scores = reranker
            .score("?!", &["anything".to_string()])
            .await
            .unwrap();
        assert_eq!(scores, vec![0.0]);
    }

    #[test]
    fn test_factory_requires_base_for_remote() {
        let mut config = corpusforge_common::config::AppConfig::default().retrieval;
        config.rerank_model = "bge-reranker-v2".to_string();
        assert!(create_reranker(&config).is_err());

        config.rerank_api_base = Some("http://localhost:9000".to_string());
        assert!(create_reranker(&config).is_ok());
    }
}
