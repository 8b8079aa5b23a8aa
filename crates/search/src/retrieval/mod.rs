//! Retrieval types and the retriever contract.

mod fusion;
mod hybrid;
mod lexical;
mod rerank;
mod vector;

pub use fusion::WeightedFusion;
pub use hybrid::HybridRetriever;
pub use lexical::{prepare_terms, LexicalRetriever};
pub use rerank::{create_reranker, OverlapReranker, RemoteReranker, Reranker};
pub use vector::VectorRetriever;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use corpusforge_common::errors::Result;
use corpusforge_common::index::ScoredNode;

/// Longest accepted query, in characters.
pub const MAX_QUERY_CHARS: usize = 8192;

/// A search request from the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,

    /// Maximum results to return
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Metadata filter: equality and `in` only
    #[serde(default)]
    pub filter: Option<Value>,

    #[serde(default = "default_true")]
    pub use_vector: bool,

    #[serde(default = "default_true")]
    pub use_lexical: bool,

    #[serde(default)]
    pub rerank: bool,
}

fn default_top_k() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: default_top_k(),
            filter: None,
            use_vector: true,
            use_lexical: true,
            rerank: false,
        }
    }
}

/// A ranked passage with its score breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub metadata: Value,

    /// Min–max normalized vector score (0 when absent from that list)
    pub vector_score: f32,
    /// Min–max normalized lexical score (0 when absent from that list)
    pub lexical_score: f32,
    /// Weighted combination of the two
    pub fused_score: f32,
    /// Cross-encoder score, when reranking ran
    pub rerank_score: Option<f32>,

    /// Byte spans of matched terms from the lexical side
    pub highlight: Option<Vec<(usize, usize)>>,
}

/// Search response with timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<RetrievalResult>,
    pub query_time_ms: u64,
}

/// Common contract for the single-signal retrievers.
#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&corpusforge_common::index::Filter>,
    ) -> Result<Vec<ScoredNode>>;

    fn mode(&self) -> &'static str;
}
