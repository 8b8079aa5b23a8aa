//! Ingestion service: the interface the API layer consumes.
//!
//! Wires the analyzer, pipeline engine, parallel executor, and incremental
//! manager together behind `ingest` / `analyze` / `status` / `delete` /
//! `cancel`. Ingest work runs as broker tasks on `document.processing`;
//! two ingests of the same document serialize on the state store's
//! per-document lock, the loser failing fast with `DocumentBusy`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use corpusforge_common::broker::{queues, SubmitOptions, TaskBroker, TaskRecord, TaskSpec};
use corpusforge_common::config::AppConfig;
use corpusforge_common::embeddings::Embedder;
use corpusforge_common::errors::{AppError, Result};
use corpusforge_common::hashing;
use corpusforge_common::index::VectorIndex;
use corpusforge_common::source::SourceStore;
use corpusforge_common::state::{DocumentRecord, DocumentStatus, FileType, StateStore};

use crate::analyzer::{Analyzer, DocumentFeatures, PlanOverrides, ProcessingPlan};
use crate::incremental::{IncrementalManager, IncrementalOutcome};
use crate::parallel::ParallelExecutor;
use crate::pipeline::processors::{default_registry, PassthroughConverter};
use crate::pipeline::{CancelCheck, Context, ProcessorRegistry, StageOutcome};

struct ServiceInner {
    analyzer: Analyzer,
    registry: ProcessorRegistry,
    executor: ParallelExecutor,
    incremental: IncrementalManager,
    broker: TaskBroker,
    state: Arc<dyn StateStore>,
    index: Arc<dyn VectorIndex>,
    source: Arc<dyn SourceStore>,
    config: AppConfig,
    /// doc_id → in-flight ingest task
    active: RwLock<HashMap<String, Uuid>>,
}

/// Cheaply cloneable handle; clones share the same state and broker.
#[derive(Clone)]
pub struct IngestionService {
    inner: Arc<ServiceInner>,
}

impl IngestionService {
    pub fn new(
        config: AppConfig,
        broker: TaskBroker,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        state: Arc<dyn StateStore>,
        source: Arc<dyn SourceStore>,
    ) -> Self {
        let registry = default_registry(
            embedder.clone(),
            index.clone(),
            state.clone(),
            Arc::new(PassthroughConverter),
        );
        Self::with_registry(config, broker, embedder, index, state, source, registry)
    }

    /// Like [`IngestionService::new`], but with a caller-built registry so
    /// deployments can layer custom processors over the defaults.
    #[allow(clippy::too_many_arguments)]
    pub fn with_registry(
        config: AppConfig,
        broker: TaskBroker,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        state: Arc<dyn StateStore>,
        source: Arc<dyn SourceStore>,
        registry: ProcessorRegistry,
    ) -> Self {
        let executor = ParallelExecutor::new(
            broker.clone(),
            embedder.clone(),
            index.clone(),
            state.clone(),
            config.clone(),
        );
        let incremental =
            IncrementalManager::new(state.clone(), index.clone(), embedder, config.clone());
        Self {
            inner: Arc::new(ServiceInner {
                analyzer: Analyzer::new(config.clone()),
                registry,
                executor,
                incremental,
                broker,
                state,
                index,
                source,
                config,
                active: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Enqueue an ingest. Returns the broker task id; progress and
    /// failures are visible on the task record and the document status.
    pub async fn ingest(
        &self,
        doc_id: &str,
        path: &str,
        metadata: Value,
        overrides: Option<PlanOverrides>,
    ) -> Result<Uuid> {
        let service = self.clone();
        let doc_id_owned = doc_id.to_string();
        let path_owned = path.to_string();

        let spec = TaskSpec::new(
            format!("ingest:{doc_id}"),
            queues::DOCUMENT_PROCESSING,
            move |tctx| {
                let service = service.clone();
                let doc_id = doc_id_owned.clone();
                let path = path_owned.clone();
                let metadata = metadata.clone();
                let overrides = overrides.clone();
                async move {
                    let cancel: CancelCheck = {
                        let tctx = tctx.clone();
                        Arc::new(move || tctx.checkpoint())
                    };
                    let result = service
                        .process_document(&doc_id, &path, metadata, overrides, cancel)
                        .await;
                    service.inner.active.write().await.remove(&doc_id);
                    let outcome = result?;
                    Ok(json!({
                        "doc_id": doc_id,
                        "node_count": outcome.node_count(),
                    }))
                }
            },
        );

        let task_id = self.inner.broker.submit(spec, SubmitOptions::default()).await?;
        self.inner
            .active
            .write()
            .await
            .insert(doc_id.to_string(), task_id);
        Ok(task_id)
    }

    /// Run a full ingest inline (used by the worker's one-shot mode and
    /// the broker task body).
    pub async fn process_document(
        &self,
        doc_id: &str,
        path: &str,
        metadata: Value,
        overrides: Option<PlanOverrides>,
        cancel: CancelCheck,
    ) -> Result<StageOutcome> {
        let ctx = self
            .build_context(doc_id, path, metadata, overrides, cancel)
            .await?;

        self.inner
            .state
            .upsert_document(&DocumentRecord {
                doc_id: ctx.doc_id.clone(),
                source_path: ctx.source_path.clone(),
                file_type: ctx.file_type,
                metadata: ctx.metadata.clone(),
                status: DocumentStatus::Pending,
                size_bytes: ctx.size_bytes,
                node_count: 0,
                last_processed_at: None,
                error: None,
            })
            .await?;

        // The per-document lock; a concurrent ingest fails here
        self.inner.state.try_begin_processing(doc_id).await?;

        match self.run_locked(&ctx).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // The executor finalizes its own failure path; everything
                // else lands here. DocumentBusy never reaches this arm.
                let message = match &e {
                    AppError::Canceled => "canceled by request".to_string(),
                    other => other.to_string(),
                };
                if !matches!(e, AppError::SegmentFailure { .. }) {
                    let _ = self
                        .inner
                        .state
                        .finish_processing(doc_id, DocumentStatus::Failed, None, Some(message))
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn run_locked(&self, ctx: &Context) -> Result<StageOutcome> {
        // Incremental path for known documents
        if ctx.plan.use_incremental {
            if let Some(prior) = self.inner.state.load_state(&ctx.doc_id).await? {
                match self.inner.incremental.process(ctx, &prior).await? {
                    IncrementalOutcome::Unchanged { node_count } => {
                        return Ok(StageOutcome::Unchanged { node_count });
                    }
                    IncrementalOutcome::Updated {
                        added,
                        removed,
                        unchanged,
                        node_count,
                    } => {
                        return Ok(StageOutcome::Updated {
                            added,
                            removed,
                            unchanged,
                            node_count,
                        });
                    }
                    IncrementalOutcome::FullReprocessRequired { delta_ratio_permille } => {
                        tracing::info!(
                            doc_id = %ctx.doc_id,
                            delta_ratio_permille,
                            "Delta too large, reprocessing in full"
                        );
                        self.inner.index.delete_by_doc(&ctx.doc_id).await?;
                    }
                }
            }
        }

        if ctx.plan.use_parallel {
            self.inner.executor.execute(ctx).await
        } else {
            let pipeline = self.inner.registry.pipeline_for(ctx.file_type, &ctx.plan)?;
            let out = pipeline.run(ctx.clone()).await?;
            out.outcome.ok_or_else(|| AppError::Internal {
                message: "pipeline finished without an outcome".to_string(),
            })
        }
    }

    async fn build_context(
        &self,
        doc_id: &str,
        path: &str,
        metadata: Value,
        overrides: Option<PlanOverrides>,
        cancel: CancelCheck,
    ) -> Result<Context> {
        let bytes = self.inner.source.read(path).await?;
        let file_hash = hashing::hash_bytes(&bytes);
        let file_type = FileType::from_path(path);
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let (_, mut plan) = self
            .inner
            .analyzer
            .analyze(file_type, &text, bytes.len() as u64)?;
        if let Some(overrides) = &overrides {
            self.inner.analyzer.apply_overrides(&mut plan, overrides)?;
        }

        Ok(Context {
            doc_id: doc_id.to_string(),
            source_path: path.to_string(),
            file_type,
            metadata,
            plan,
            size_bytes: bytes.len() as u64,
            file_hash,
            cancel,
            text,
            markdown: None,
            chunks: Vec::new(),
            nodes: Vec::new(),
            outcome: None,
        })
    }

    /// Analyze without ingesting.
    pub async fn analyze(&self, path: &str) -> Result<(DocumentFeatures, ProcessingPlan)> {
        let bytes = self.inner.source.read(path).await?;
        let file_type = FileType::from_path(path);
        let text = String::from_utf8_lossy(&bytes);
        self.inner
            .analyzer
            .analyze(file_type, &text, bytes.len() as u64)
    }

    /// Current document record.
    pub async fn status(&self, doc_id: &str) -> Result<DocumentRecord> {
        self.inner
            .state
            .get_document(doc_id)
            .await?
            .ok_or_else(|| AppError::DocumentNotFound {
                doc_id: doc_id.to_string(),
            })
    }

    /// Purge a document: chunks, state blob, and record.
    pub async fn delete(&self, doc_id: &str) -> Result<()> {
        if let Some(task_id) = self.inner.active.write().await.remove(doc_id) {
            let _ = self.inner.broker.cancel(task_id).await;
        }
        let removed = self.inner.index.delete_by_doc(doc_id).await?;
        self.inner.state.delete_document(doc_id).await?;
        tracing::info!(doc_id, removed_chunks = removed, "Document purged");
        Ok(())
    }

    /// Cancel an in-flight ingest by document id. The running task stops
    /// at its next checkpoint; the executor then rolls back per policy.
    pub async fn cancel_document(&self, doc_id: &str) -> Result<bool> {
        let was_processing = self.inner.state.request_cancel(doc_id).await?;
        if let Some(task_id) = self.inner.active.read().await.get(doc_id).copied() {
            self.inner.broker.cancel(task_id).await?;
            return Ok(true);
        }
        Ok(was_processing)
    }

    /// Cancel by broker task id.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        self.inner.broker.cancel(task_id).await
    }

    /// Broker record for an ingest task (progress, state, result).
    pub async fn task_record(&self, task_id: Uuid) -> Result<TaskRecord> {
        self.inner.broker.record(task_id).await
    }

    pub fn broker(&self) -> &TaskBroker {
        &self.inner.broker
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::no_cancel;
    use corpusforge_common::embeddings::MockEmbedder;
    use corpusforge_common::index::MemoryIndex;
    use corpusforge_common::source::MemorySourceStore;
    use corpusforge_common::state::MemoryStateStore;

    struct Fixture {
        service: IngestionService,
        index: Arc<MemoryIndex>,
        state: Arc<MemoryStateStore>,
        source: Arc<MemorySourceStore>,
    }

    fn fixture() -> Fixture {
        let config = AppConfig::default();
        let broker = TaskBroker::new(config.broker.clone());
        let index = Arc::new(MemoryIndex::new());
        let state = Arc::new(MemoryStateStore::new());
        let source = Arc::new(MemorySourceStore::new());
        let service = IngestionService::new(
            config,
            broker,
            Arc::new(MockEmbedder::new(32)),
            index.clone(),
            state.clone(),
            source.clone(),
        );
        Fixture {
            service,
            index,
            state,
            source,
        }
    }

    #[tokio::test]
    async fn test_ingest_small_markdown() {
        let f = fixture();
        f.source.put("notes.md", "# Title\n\npara one.\n\npara two.");

        let overrides = PlanOverrides {
            chunking_type: Some("recursive_markdown".to_string()),
            chunk_size: Some(40),
            chunk_overlap: Some(0),
            ..Default::default()
        };
        let task_id = f
            .service
            .ingest("doc-md", "notes.md", json!({"title": "Notes"}), Some(overrides))
            .await
            .unwrap();

        let result = f.service.broker().wait_result(task_id).await.unwrap();
        assert_eq!(result["node_count"], json!(2));

        let record = f.service.status("doc-md").await.unwrap();
        assert_eq!(record.status, DocumentStatus::Completed);
        assert_eq!(record.node_count, 2);
        assert_eq!(f.index.ordinals_for_doc("doc-md"), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_ingest_twice_is_idempotent() {
        let f = fixture();
        f.source.put(
            "a.txt",
            "First sentence here. Second sentence here. Third sentence follows now.",
        );

        let service = &f.service;
        service
            .process_document("doc-a", "a.txt", json!({}), None, no_cancel())
            .await
            .unwrap();
        let ids_first = f.index.chunk_ids_for_doc("doc-a");
        let state_first = f.state.load_state("doc-a").await.unwrap().unwrap();
        let nodes_first: Vec<_> = ids_first.iter().map(|id| f.index.get(id).unwrap()).collect();

        let outcome = service
            .process_document("doc-a", "a.txt", json!({}), None, no_cancel())
            .await
            .unwrap();
        // Identical bytes short-circuit as unchanged
        assert!(matches!(outcome, StageOutcome::Unchanged { .. }));

        let ids_second = f.index.chunk_ids_for_doc("doc-a");
        let state_second = f.state.load_state("doc-a").await.unwrap().unwrap();
        assert_eq!(ids_first, ids_second);
        assert_eq!(state_first.chunk_hashes, state_second.chunk_hashes);
        for (id, before) in ids_first.iter().zip(nodes_first) {
            assert_eq!(f.index.get(id).unwrap(), before, "index changed for {id}");
        }
    }

    #[tokio::test]
    async fn test_concurrent_ingests_one_wins() {
        let f = fixture();
        f.source.put("big.txt", "A long sentence for the test. ".repeat(50));

        // Hold the lock as a slow first ingest would
        f.state
            .upsert_document(&DocumentRecord::new("doc-c", "big.txt", FileType::Txt))
            .await
            .unwrap();
        f.state.try_begin_processing("doc-c").await.unwrap();

        let err = f
            .service
            .process_document("doc-c", "big.txt", json!({}), None, no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DocumentBusy { .. }));

        // The loser must not clobber the winner's processing status
        let record = f.state.get_document("doc-c").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Processing);
    }

    #[tokio::test]
    async fn test_delete_purges_everything() {
        let f = fixture();
        f.source.put("b.md", "# B\n\nsome content here.");
        f.service
            .process_document("doc-b", "b.md", json!({}), None, no_cancel())
            .await
            .unwrap();
        assert!(f.index.count_by_doc("doc-b").await.unwrap() > 0);

        f.service.delete("doc-b").await.unwrap();
        assert_eq!(f.index.count_by_doc("doc-b").await.unwrap(), 0);
        assert!(f.state.get_document("doc-b").await.unwrap().is_none());
        assert!(f.state.load_state("doc-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsupported_file_type_fails_validation() {
        let f = fixture();
        let binary: Vec<u8> = (0u8..32).collect();
        f.source.put("blob.bin", binary);

        let err = f
            .service
            .process_document("doc-bin", "blob.bin", json!({}), None, no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFileType { .. }));
    }

    #[tokio::test]
    async fn test_status_surfaces_failure() {
        let f = fixture();
        f.source.put("empty.txt", "   ");

        let err = f
            .service
            .process_document("doc-e", "empty.txt", json!({}), None, no_cancel())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("validate"));

        let record = f.service.status("doc-e").await.unwrap();
        assert_eq!(record.status, DocumentStatus::Failed);
        assert!(record.error.unwrap().contains("Empty document"));
    }

    #[tokio::test]
    async fn test_analyze_reports_plan() {
        let f = fixture();
        f.source.put("plan.md", "# H\n\nsome body text for the analyzer.");
        let (features, plan) = f.service.analyze("plan.md").await.unwrap();
        assert_eq!(features.heading_count, 1);
        assert_eq!(plan.chunking.kind, crate::chunking::ChunkKind::RecursiveMarkdown);
    }
}
