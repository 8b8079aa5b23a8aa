//! End-to-end: ingest documents through the ingestion service, then query
//! them through the hybrid retriever over the same index.

use std::sync::Arc;

use corpusforge_common::broker::TaskBroker;
use corpusforge_common::config::AppConfig;
use corpusforge_common::embeddings::{Embedder, MockEmbedder};
use corpusforge_common::index::{MemoryIndex, VectorIndex};
use corpusforge_common::source::MemorySourceStore;
use corpusforge_common::state::MemoryStateStore;
use corpusforge_ingestion::pipeline::no_cancel;
use corpusforge_ingestion::{IngestionService, PlanOverrides};
use corpusforge_search::retrieval::{HybridRetriever, OverlapReranker, Reranker, SearchRequest};

struct World {
    service: IngestionService,
    retriever: HybridRetriever,
    index: Arc<MemoryIndex>,
    source: Arc<MemorySourceStore>,
}

fn world() -> World {
    let config = AppConfig::default();
    let broker = TaskBroker::new(config.broker.clone());
    let embedder: Arc<MockEmbedder> = Arc::new(MockEmbedder::new(128));
    let index = Arc::new(MemoryIndex::new());
    let state = Arc::new(MemoryStateStore::new());
    let source = Arc::new(MemorySourceStore::new());

    let service = IngestionService::new(
        config.clone(),
        broker,
        embedder.clone() as Arc<dyn Embedder>,
        index.clone(),
        state,
        source.clone(),
    );
    let retriever = HybridRetriever::new(
        embedder as Arc<dyn Embedder>,
        index.clone(),
        &config.retrieval,
        Some(Arc::new(OverlapReranker) as Arc<dyn Reranker>),
    );
    World {
        service,
        retriever,
        index,
        source,
    }
}

#[tokio::test]
async fn ingested_markdown_is_retrievable() {
    let w = world();
    w.source.put(
        "vector-dbs.md",
        "# Vector stores\n\nMilvus supports HNSW index structures for dense retrieval.\n\nElasticsearch combines keyword and vector ranking.",
    );
    w.source.put(
        "queues.md",
        "# Queues\n\nBrokers deliver tasks to workers with retries and timeouts.",
    );

    w.service
        .process_document("doc-vec", "vector-dbs.md", serde_json::json!({}), None, no_cancel())
        .await
        .unwrap();
    w.service
        .process_document("doc-q", "queues.md", serde_json::json!({}), None, no_cancel())
        .await
        .unwrap();

    let response = w
        .retriever
        .search(&SearchRequest::new("HNSW index"))
        .await
        .unwrap();

    assert!(!response.results.is_empty());
    let top = &response.results[0];
    assert_eq!(top.doc_id, "doc-vec");
    assert!(top.text.contains("HNSW"));
    assert!(top.fused_score >= 0.9);
}

#[tokio::test]
async fn search_tracks_incremental_updates() {
    let w = world();
    let original =
        "Alpha paragraph about storage engines.\n\nBeta paragraph about compaction.\n\nGamma paragraph about replication.";
    w.source.put("notes.txt", original);

    let overrides = PlanOverrides {
        chunk_size: Some(60),
        chunk_overlap: Some(0),
        ..Default::default()
    };
    w.service
        .process_document(
            "doc-n",
            "notes.txt",
            serde_json::json!({}),
            Some(overrides.clone()),
            no_cancel(),
        )
        .await
        .unwrap();

    // Edit the middle paragraph only
    let edited =
        "Alpha paragraph about storage engines.\n\nBeta paragraph now covers quorum writes.\n\nGamma paragraph about replication.";
    w.source.put("notes.txt", edited);
    w.service
        .process_document(
            "doc-n",
            "notes.txt",
            serde_json::json!({}),
            Some(overrides),
            no_cancel(),
        )
        .await
        .unwrap();

    let response = w
        .retriever
        .search(&SearchRequest::new("quorum writes"))
        .await
        .unwrap();
    assert!(!response.results.is_empty());
    assert!(response.results[0].text.contains("quorum writes"));

    // The stale text is gone from the index
    assert_eq!(w.index.count_by_doc("doc-n").await.unwrap(), 3);
    let all_text: Vec<String> = w
        .index
        .chunk_ids_for_doc("doc-n")
        .iter()
        .map(|id| w.index.get(id).unwrap().text)
        .collect();
    assert!(!all_text.iter().any(|t| t.contains("about compaction")));
}

#[tokio::test]
async fn rerank_keeps_results_relevant() {
    let w = world();
    w.source.put(
        "a.md",
        "# Indexing\n\nThe HNSW index trades memory for recall at query time.",
    );
    w.source
        .put("b.md", "# Cooking\n\nSlow roasting brings out sweetness.");

    w.service
        .process_document("doc-a", "a.md", serde_json::json!({}), None, no_cancel())
        .await
        .unwrap();
    w.service
        .process_document("doc-b", "b.md", serde_json::json!({}), None, no_cancel())
        .await
        .unwrap();

    let request = SearchRequest {
        rerank: true,
        ..SearchRequest::new("HNSW index recall")
    };
    let response = w.retriever.search(&request).await.unwrap();
    assert_eq!(response.results[0].doc_id, "doc-a");
    assert!(response.results[0].rerank_score.is_some());
}
