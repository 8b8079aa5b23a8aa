//! Lexical retrieval: term extraction plus the index's keyword search.

use std::sync::Arc;

use corpusforge_common::errors::Result;
use corpusforge_common::index::{Filter, ScoredNode, VectorIndex};

use super::Retriever;

/// Prepare query terms for lexical search: split on whitespace, strip
/// punctuation, drop one-character fragments. CJK text passes through as
/// whole tokens since `is_alphanumeric` covers it.
pub fn prepare_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

pub struct LexicalRetriever {
    index: Arc<dyn VectorIndex>,
}

impl LexicalRetriever {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self { index }
    }
}

#[async_trait::async_trait]
impl Retriever for LexicalRetriever {
    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredNode>> {
        let terms = prepare_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let hits = self.index.lexical_search(&terms, k, filter).await?;
        tracing::debug!(query, terms = terms.len(), hits = hits.len(), "Lexical search done");
        Ok(hits)
    }

    fn mode(&self) -> &'static str {
        "lexical"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_terms_strips_punctuation() {
        assert_eq!(
            prepare_terms("What is HNSW, exactly?"),
            vec!["What", "is", "HNSW", "exactly"]
        );
    }

    #[test]
    fn test_prepare_terms_drops_single_chars() {
        assert_eq!(prepare_terms("a b cd"), vec!["cd"]);
    }

    #[test]
    fn test_prepare_terms_keeps_cjk() {
        assert_eq!(prepare_terms("向量检索 引擎"), vec!["向量检索", "引擎"]);
    }
}
