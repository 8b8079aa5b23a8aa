//! Hybrid retrieval engine.
//!
//! Runs dense and lexical search in parallel with an over-fetch of
//! 3 × top_k each, fuses the lists with weighted min–max normalization,
//! deduplicates, optionally reranks the head of the fused list, and
//! returns the top_k passages.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use corpusforge_common::config::RetrievalConfig;
use corpusforge_common::embeddings::Embedder;
use corpusforge_common::errors::{AppError, Result};
use corpusforge_common::index::{Filter, VectorIndex};
use corpusforge_common::metrics::record_search;

use super::{
    LexicalRetriever, RetrievalResult, Retriever, SearchRequest, SearchResponse, VectorRetriever,
    WeightedFusion, MAX_QUERY_CHARS,
};
use super::rerank::Reranker;

/// Over-fetch factor for each side before fusion.
const CANDIDATE_FACTOR: usize = 3;

pub struct HybridRetriever {
    vector: VectorRetriever,
    lexical: LexicalRetriever,
    fusion: WeightedFusion,
    reranker: Option<Arc<dyn Reranker>>,
    rerank_top_n: usize,
}

impl HybridRetriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        config: &RetrievalConfig,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Self {
        Self {
            vector: VectorRetriever::new(embedder, index.clone()),
            lexical: LexicalRetriever::new(index),
            fusion: WeightedFusion::new(config.w_vector, config.w_lexical),
            reranker,
            rerank_top_n: config.rerank_top_n,
        }
    }

    /// Execute a search. Empty or overlong queries are rejected; zero
    /// hits return an empty list, not an error.
    #[tracing::instrument(skip(self, request), fields(top_k = request.top_k))]
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let started = Instant::now();

        let query = request.query.trim();
        if query.is_empty() {
            return Err(AppError::InvalidQuery {
                message: "query is empty".to_string(),
            });
        }
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(AppError::InvalidQuery {
                message: format!("query exceeds {MAX_QUERY_CHARS} characters"),
            });
        }
        if !request.use_vector && !request.use_lexical {
            return Err(AppError::InvalidQuery {
                message: "at least one of use_vector/use_lexical must be set".to_string(),
            });
        }

        let filter = match &request.filter {
            Some(value) => Some(Filter::from_json(value)?),
            None => None,
        };
        let filter_ref = filter.as_ref();

        let k = request.top_k.max(1) * CANDIDATE_FACTOR;

        // Both sides run concurrently; a disabled side contributes an
        // empty list (its fused weight side becomes 0 for everyone).
        let (vector_hits, lexical_hits) = tokio::join!(
            async {
                if request.use_vector {
                    self.vector.retrieve(query, k, filter_ref).await
                } else {
                    Ok(Vec::new())
                }
            },
            async {
                if request.use_lexical {
                    self.lexical.retrieve(query, k, filter_ref).await
                } else {
                    Ok(Vec::new())
                }
            },
        );

        let mut results = self.fusion.fuse(vector_hits?, lexical_hits?);

        if request.rerank {
            if let Some(reranker) = &self.reranker {
                self.rerank(query, &mut results, reranker).await?;
            }
        }

        results.truncate(request.top_k);

        let mode = match (request.use_vector, request.use_lexical) {
            (true, true) => "hybrid",
            (true, false) => "vector",
            _ => "lexical",
        };
        let elapsed = started.elapsed();
        record_search(elapsed.as_secs_f64(), mode, results.len());
        tracing::info!(
            query,
            mode,
            results = results.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Search complete"
        );

        Ok(SearchResponse {
            results,
            query_time_ms: elapsed.as_millis() as u64,
        })
    }

    /// Rerank the head of the fused list; re-sort by rerank score with
    /// fused score as tiebreak, keeping the tail behind the head.
    async fn rerank(
        &self,
        query: &str,
        results: &mut Vec<RetrievalResult>,
        reranker: &Arc<dyn Reranker>,
    ) -> Result<()> {
        let n = self.rerank_top_n.min(results.len());
        if n == 0 {
            return Ok(());
        }

        let documents: Vec<String> = results[..n].iter().map(|r| r.text.clone()).collect();
        let scores = reranker.score(query, &documents).await?;

        for (result, score) in results[..n].iter_mut().zip(scores) {
            result.rerank_score = Some(score);
        }
        results[..n].sort_by(|a, b| {
            let ra = a.rerank_score.unwrap_or(0.0);
            let rb = b.rerank_score.unwrap_or(0.0);
            rb.partial_cmp(&ra)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.fused_score
                        .partial_cmp(&a.fused_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        Ok(())
    }
}

/// Convenience wrapper matching the upward `search` interface.
pub async fn search(
    retriever: &HybridRetriever,
    query: &str,
    top_k: usize,
    filter: Option<Value>,
) -> Result<Vec<RetrievalResult>> {
    let request = SearchRequest {
        query: query.to_string(),
        top_k,
        filter,
        use_vector: true,
        use_lexical: true,
        rerank: false,
    };
    Ok(retriever.search(&request).await?.results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use corpusforge_common::config::AppConfig;
    use corpusforge_common::embeddings::{Embedder, MockEmbedder};
    use corpusforge_common::hashing;
    use corpusforge_common::index::{MemoryIndex, Node};
    use serde_json::json;

    use crate::retrieval::OverlapReranker;

    async fn seed_chunks(index: &MemoryIndex, embedder: &MockEmbedder, docs: &[(&str, &str)]) {
        for (i, (doc_id, text)) in docs.iter().enumerate() {
            let embedding = embedder.embed(&[text.to_string()]).await.unwrap().remove(0);
            index
                .upsert(&[Node {
                    chunk_id: Node::chunk_id_for(doc_id, 0),
                    doc_id: doc_id.to_string(),
                    ordinal: 0,
                    text: text.to_string(),
                    embedding,
                    metadata: json!({"file_type": "md", "n": i}),
                    content_hash: hashing::hash_text(text),
                }])
                .await
                .unwrap();
        }
    }

    struct Fixture {
        retriever: HybridRetriever,
        index: Arc<MemoryIndex>,
        embedder: Arc<MockEmbedder>,
    }

    fn fixture(rerank: bool) -> Fixture {
        let config = AppConfig::default().retrieval;
        let embedder = Arc::new(MockEmbedder::new(256));
        let index = Arc::new(MemoryIndex::new());
        let reranker: Option<Arc<dyn Reranker>> =
            rerank.then(|| Arc::new(OverlapReranker) as Arc<dyn Reranker>);
        let retriever = HybridRetriever::new(
            embedder.clone(),
            index.clone(),
            &config,
            reranker,
        );
        Fixture {
            retriever,
            index,
            embedder,
        }
    }

    #[tokio::test]
    async fn test_exact_match_ranks_first_with_high_fused_score() {
        let f = fixture(false);
        seed_chunks(
            &f.index,
            &f.embedder,
            &[
                ("doc-milvus", "Milvus supports HNSW index"),
                ("doc-other", "Postgres stores relational rows"),
                ("doc-third", "Kafka streams events between services"),
            ],
        )
        .await;

        let request = SearchRequest {
            query: "HNSW index".to_string(),
            top_k: 5,
            filter: None,
            use_vector: true,
            use_lexical: true,
            rerank: false,
        };
        let response = f.retriever.search(&request).await.unwrap();

        assert!(!response.results.is_empty());
        let top = &response.results[0];
        assert_eq!(top.doc_id, "doc-milvus");
        assert!(
            top.fused_score >= 0.9,
            "fused score {} below 0.9",
            top.fused_score
        );
        // Lexical side produced highlight spans
        let highlight = top.highlight.as_ref().unwrap();
        assert!(!highlight.is_empty());
        let (s, e) = highlight[0];
        assert_eq!(&top.text[s..e], "HNSW");
    }

    #[tokio::test]
    async fn test_empty_query_is_invalid() {
        let f = fixture(false);
        let request = SearchRequest::new("   ");
        let err = f.retriever.search(&request).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidQuery { .. }));
    }

    #[tokio::test]
    async fn test_zero_hits_is_empty_not_error() {
        let f = fixture(false);
        let request = SearchRequest::new("anything at all");
        let response = f.retriever.search(&request).await.unwrap();
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn test_adding_matching_document_surfaces_it() {
        let f = fixture(false);
        seed_chunks(
            &f.index,
            &f.embedder,
            &[
                ("doc-a", "gardening tips for spring"),
                ("doc-b", "recipes with seasonal vegetables"),
            ],
        )
        .await;

        let request = SearchRequest::new("cooperative scheduling runtime");
        let before = f.retriever.search(&request).await.unwrap();
        let best_before = before.results.first().map(|r| r.fused_score).unwrap_or(0.0);

        seed_chunks(
            &f.index,
            &f.embedder,
            &[("doc-new", "cooperative scheduling runtime internals")],
        )
        .await;

        let after = f.retriever.search(&request).await.unwrap();
        let top = &after.results[0];
        assert_eq!(top.doc_id, "doc-new");
        assert!(top.fused_score >= best_before);
    }

    #[tokio::test]
    async fn test_filter_restricts_results() {
        let f = fixture(false);
        seed_chunks(
            &f.index,
            &f.embedder,
            &[
                ("doc-a", "shared phrase in both documents"),
                ("doc-b", "shared phrase in both documents"),
            ],
        )
        .await;

        let request = SearchRequest {
            query: "shared phrase".to_string(),
            top_k: 10,
            filter: Some(json!({"doc_id": "doc-b"})),
            use_vector: true,
            use_lexical: true,
            rerank: false,
        };
        let response = f.retriever.search(&request).await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].doc_id, "doc-b");
    }

    #[tokio::test]
    async fn test_unsupported_filter_is_refused() {
        let f = fixture(false);
        let request = SearchRequest {
            query: "query".to_string(),
            top_k: 5,
            filter: Some(json!({"size": {"gt": 3}})),
            use_vector: true,
            use_lexical: true,
            rerank: false,
        };
        let err = f.retriever.search(&request).await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFilter { .. }));
    }

    #[tokio::test]
    async fn test_rerank_reorders_head_with_fused_tiebreak() {
        let f = fixture(true);
        seed_chunks(
            &f.index,
            &f.embedder,
            &[
                // Shares embedding terms with the query but not the
                // literal phrase the reranker rewards
                ("doc-near", "index tuning and HNSW parameters deep dive"),
                ("doc-exact", "how the HNSW index works"),
                ("doc-far", "unrelated cooking instructions"),
            ],
        )
        .await;

        let request = SearchRequest {
            query: "HNSW index".to_string(),
            top_k: 3,
            filter: None,
            use_vector: true,
            use_lexical: true,
            rerank: true,
        };
        let response = f.retriever.search(&request).await.unwrap();
        let top = &response.results[0];
        assert!(top.rerank_score.is_some());
        // Both HNSW docs contain every query term; the overlap scorer
        // favors the shorter passage, fused score breaks remaining ties
        assert_ne!(top.doc_id, "doc-far");
    }

    #[tokio::test]
    async fn test_vector_only_and_lexical_only_flags() {
        let f = fixture(false);
        seed_chunks(&f.index, &f.embedder, &[("doc-a", "alpha beta gamma")]).await;

        let vector_only = SearchRequest {
            use_lexical: false,
            ..SearchRequest::new("alpha beta")
        };
        let response = f.retriever.search(&vector_only).await.unwrap();
        assert!(response.results.iter().all(|r| r.lexical_score == 0.0));

        let lexical_only = SearchRequest {
            use_vector: false,
            ..SearchRequest::new("alpha beta")
        };
        let response = f.retriever.search(&lexical_only).await.unwrap();
        assert!(response.results.iter().all(|r| r.vector_score == 0.0));

        let neither = SearchRequest {
            use_vector: false,
            use_lexical: false,
            ..SearchRequest::new("alpha")
        };
        assert!(f.retriever.search(&neither).await.is_err());
    }
}
