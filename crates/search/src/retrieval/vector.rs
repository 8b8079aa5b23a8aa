//! Dense retrieval: embed the query, search the index.

use std::sync::Arc;

use corpusforge_common::embeddings::Embedder;
use corpusforge_common::errors::Result;
use corpusforge_common::index::{Filter, ScoredNode, VectorIndex};

use super::Retriever;

pub struct VectorRetriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl VectorRetriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, index }
    }
}

#[async_trait::async_trait]
impl Retriever for VectorRetriever {
    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredNode>> {
        let embeddings = self.embedder.embed(&[query.to_string()]).await?;
        let query_vec = embeddings.into_iter().next().unwrap_or_default();
        let hits = self.index.vector_search(&query_vec, k, filter).await?;
        tracing::debug!(query, hits = hits.len(), "Vector search done");
        Ok(hits)
    }

    fn mode(&self) -> &'static str {
        "vector"
    }
}
