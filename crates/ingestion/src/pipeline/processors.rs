//! Default processors for each pipeline stage.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::json;

use corpusforge_common::embeddings::Embedder;
use corpusforge_common::errors::{AppError, Result};
use corpusforge_common::hashing;
use corpusforge_common::index::{Node, VectorIndex};
use corpusforge_common::metrics::record_ingest;
use corpusforge_common::state::{DocumentState, DocumentStatus, FileType, StateStore};

use super::{Context, Processor, ProcessorRegistry, Stage, StageOutcome};
use crate::chunking::{self, ChunkPiece};

/// Markdown conversion is an external collaborator; the core only sees
/// this interface. The passthrough implementation covers deployments
/// where conversion happens upstream of ingestion.
pub trait MarkdownConverter: Send + Sync {
    fn convert(&self, text: &str, file_type: FileType) -> Result<String>;
}

/// Normalizes line endings and collapses blank-line runs, leaving the
/// content otherwise untouched.
#[derive(Default)]
pub struct PassthroughConverter;

impl MarkdownConverter for PassthroughConverter {
    fn convert(&self, text: &str, _file_type: FileType) -> Result<String> {
        static BLANK_RUNS: OnceLock<Regex> = OnceLock::new();
        let blank_runs = BLANK_RUNS.get_or_init(|| Regex::new(r"\n[ \t]*\n[\s]*\n").expect("static regex"));

        let unified = text.replace("\r\n", "\n").replace('\r', "\n");
        Ok(blank_runs.replace_all(&unified, "\n\n").into_owned())
    }
}

/// Register the default processor set.
pub fn default_registry(
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    state: Arc<dyn StateStore>,
    converter: Arc<dyn MarkdownConverter>,
) -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();
    registry.register(Arc::new(ValidateProcessor));
    registry.register(Arc::new(NormalizeProcessor { converter }));
    registry.register(Arc::new(ChunkProcessor));
    registry.register(Arc::new(EmbedProcessor { embedder }));
    registry.register(Arc::new(IndexProcessor { index }));
    registry.register(Arc::new(FinalizeProcessor { state }));
    registry
}

/// Validates the decoded document before any work happens.
pub struct ValidateProcessor;

#[async_trait]
impl Processor for ValidateProcessor {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn stage(&self) -> Stage {
        Stage::Validate
    }

    async fn process(&self, ctx: Context) -> Result<Context> {
        if ctx.text.trim().is_empty() {
            return Err(AppError::EmptyDocument {
                path: ctx.source_path.clone(),
            });
        }
        tracing::info!(
            doc_id = %ctx.doc_id,
            file_type = %ctx.file_type,
            size_bytes = ctx.size_bytes,
            "Document validated"
        );
        Ok(ctx)
    }
}

/// Runs the configured markdown converter.
pub struct NormalizeProcessor {
    converter: Arc<dyn MarkdownConverter>,
}

#[async_trait]
impl Processor for NormalizeProcessor {
    fn name(&self) -> &'static str {
        "markdown_normalize"
    }

    fn stage(&self) -> Stage {
        Stage::Normalize
    }

    fn supports(&self, file_type: FileType) -> bool {
        !matches!(file_type, FileType::Code)
    }

    async fn process(&self, mut ctx: Context) -> Result<Context> {
        let markdown = self.converter.convert(&ctx.text, ctx.file_type)?;
        ctx.markdown = Some(markdown);
        Ok(ctx)
    }
}

/// Runs the planned chunker.
pub struct ChunkProcessor;

#[async_trait]
impl Processor for ChunkProcessor {
    fn name(&self) -> &'static str {
        "chunk"
    }

    fn stage(&self) -> Stage {
        Stage::Chunk
    }

    async fn process(&self, mut ctx: Context) -> Result<Context> {
        let chunks = chunking::chunk(ctx.content(), &ctx.plan.chunking);
        if chunks.is_empty() {
            return Err(AppError::Validation {
                message: "chunking produced no chunks".to_string(),
            });
        }
        tracing::debug!(
            doc_id = %ctx.doc_id,
            chunks = chunks.len(),
            kind = ctx.plan.chunking.kind.as_str(),
            "Document chunked"
        );
        ctx.chunks = chunks;
        Ok(ctx)
    }
}

/// Builds nodes: embeds chunk batches and assigns deterministic chunk ids.
pub struct EmbedProcessor {
    pub embedder: Arc<dyn Embedder>,
}

#[async_trait]
impl Processor for EmbedProcessor {
    fn name(&self) -> &'static str {
        "embed"
    }

    fn stage(&self) -> Stage {
        Stage::Embed
    }

    async fn process(&self, mut ctx: Context) -> Result<Context> {
        let nodes = build_nodes(
            &self.embedder,
            &ctx.doc_id,
            ctx.file_type,
            &ctx.plan.datasource,
            &ctx.metadata,
            &ctx.chunks,
            0,
            &ctx.cancel,
        )
        .await?;
        ctx.nodes = nodes;
        Ok(ctx)
    }
}

/// Embed chunks (in provider-bounded batches) and produce nodes whose
/// ordinals start at `ordinal_base`. Cancellation is checked before each
/// batch.
#[allow(clippy::too_many_arguments)]
pub async fn build_nodes(
    embedder: &Arc<dyn Embedder>,
    doc_id: &str,
    file_type: FileType,
    datasource: &str,
    doc_metadata: &serde_json::Value,
    chunks: &[ChunkPiece],
    ordinal_base: usize,
    cancel: &super::CancelCheck,
) -> Result<Vec<Node>> {
    let mut nodes = Vec::with_capacity(chunks.len());

    // The embedder splits internally too, but batching here keeps
    // cancellation responsive between provider calls.
    const EMBED_SLICE: usize = 64;

    for (slice_index, slice) in chunks.chunks(EMBED_SLICE).enumerate() {
        cancel().map_err(|e| e.in_stage("embed", Some(ordinal_base + slice_index * EMBED_SLICE)))?;

        let texts: Vec<String> = slice.iter().map(|c| c.text.clone()).collect();
        let embeddings = embedder
            .embed(&texts)
            .await
            .map_err(|e| e.in_stage("embed", Some(ordinal_base + slice_index * EMBED_SLICE)))?;

        for (offset, (chunk, embedding)) in slice.iter().zip(embeddings).enumerate() {
            let ordinal = ordinal_base + slice_index * EMBED_SLICE + offset;
            let mut metadata = json!({
                "file_type": file_type.as_str(),
                "datasource": datasource,
                "boundary_kind": chunk.meta.boundary.map(|b| b.as_str()),
                "heading_path": chunk.meta.heading_path,
                "oversized": chunk.meta.oversized,
                "start": chunk.meta.start,
                "end": chunk.meta.end,
            });
            if let (Some(target), Some(source)) = (metadata.as_object_mut(), doc_metadata.as_object())
            {
                for (k, v) in source {
                    target.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }

            nodes.push(Node {
                chunk_id: Node::chunk_id_for(doc_id, ordinal),
                doc_id: doc_id.to_string(),
                ordinal,
                text: chunk.text.clone(),
                embedding,
                metadata,
                content_hash: hashing::hash_text(&chunk.text),
            });
        }
    }

    Ok(nodes)
}

/// Upserts nodes into the vector index.
pub struct IndexProcessor {
    pub index: Arc<dyn VectorIndex>,
}

#[async_trait]
impl Processor for IndexProcessor {
    fn name(&self) -> &'static str {
        "index"
    }

    fn stage(&self) -> Stage {
        Stage::Index
    }

    async fn process(&self, ctx: Context) -> Result<Context> {
        (ctx.cancel)().map_err(|e| e.in_stage("index", None))?;
        self.index
            .upsert(&ctx.nodes)
            .await
            .map_err(|e| e.in_stage("index", None))?;
        tracing::debug!(doc_id = %ctx.doc_id, nodes = ctx.nodes.len(), "Nodes upserted");
        Ok(ctx)
    }
}

/// Writes the DocumentState and flips the document to completed.
pub struct FinalizeProcessor {
    pub state: Arc<dyn StateStore>,
}

#[async_trait]
impl Processor for FinalizeProcessor {
    fn name(&self) -> &'static str {
        "finalize"
    }

    fn stage(&self) -> Stage {
        Stage::Finalize
    }

    async fn process(&self, mut ctx: Context) -> Result<Context> {
        let started = Instant::now();
        let node_count = ctx.nodes.len();

        let state = DocumentState {
            doc_id: ctx.doc_id.clone(),
            file_hash: ctx.file_hash.clone(),
            chunk_hashes: ctx.nodes.iter().map(|n| n.content_hash.clone()).collect(),
            chunk_ids: ctx.nodes.iter().map(|n| n.chunk_id.clone()).collect(),
            last_processed_at: Utc::now(),
            metadata_snapshot: ctx.metadata.clone(),
        };
        self.state.save_state(&state).await?;
        self.state
            .finish_processing(&ctx.doc_id, DocumentStatus::Completed, Some(node_count), None)
            .await?;

        record_ingest(started.elapsed().as_secs_f64(), node_count, "completed");
        tracing::info!(doc_id = %ctx.doc_id, node_count, "Document ingest finalized");

        ctx.outcome = Some(StageOutcome::Completed { node_count });
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::pipeline::no_cancel;
    use corpusforge_common::config::AppConfig;
    use corpusforge_common::embeddings::MockEmbedder;
    use corpusforge_common::index::MemoryIndex;
    use corpusforge_common::state::{DocumentRecord, MemoryStateStore};

    fn context(doc_id: &str, text: &str, file_type: FileType) -> Context {
        let analyzer = Analyzer::new(AppConfig::default());
        let (_, plan) = analyzer.analyze(file_type, text, text.len() as u64).unwrap();
        Context {
            doc_id: doc_id.into(),
            source_path: format!("mem://{doc_id}"),
            file_type,
            metadata: json!({"title": "t"}),
            plan,
            size_bytes: text.len() as u64,
            file_hash: hashing::hash_text(text),
            cancel: no_cancel(),
            text: text.into(),
            markdown: None,
            chunks: Vec::new(),
            nodes: Vec::new(),
            outcome: None,
        }
    }

    #[tokio::test]
    async fn test_validate_rejects_empty() {
        let ctx = context("d1", "   ", FileType::Txt);
        let err = ValidateProcessor.process(ctx).await.unwrap_err();
        assert!(matches!(err, AppError::EmptyDocument { .. }));
    }

    #[tokio::test]
    async fn test_passthrough_converter_normalizes() {
        let converter = PassthroughConverter;
        let out = converter
            .convert("a\r\nb\n\n\n\nc", FileType::Txt)
            .unwrap();
        assert_eq!(out, "a\nb\n\nc");
    }

    #[tokio::test]
    async fn test_full_pipeline_produces_contiguous_nodes() {
        let embedder: Arc<dyn Embedder> = Arc::new(MockEmbedder::new(64));
        let index = Arc::new(MemoryIndex::new());
        let state = Arc::new(MemoryStateStore::new());

        let registry = default_registry(
            embedder,
            index.clone(),
            state.clone(),
            Arc::new(PassthroughConverter),
        );

        let text = "# Title\n\npara one.\n\npara two.";
        let mut ctx = context("doc-1", text, FileType::Md);
        ctx.plan.chunking.chunk_size = 40;
        ctx.plan.chunking.chunk_overlap = 0;

        state
            .upsert_document(&DocumentRecord::new("doc-1", "mem://doc-1", FileType::Md))
            .await
            .unwrap();
        state.try_begin_processing("doc-1").await.unwrap();

        let pipeline = registry.pipeline_for(FileType::Md, &ctx.plan).unwrap();
        let out = pipeline.run(ctx).await.unwrap();

        assert_eq!(out.outcome, Some(StageOutcome::Completed { node_count: 2 }));
        assert_eq!(index.ordinals_for_doc("doc-1"), vec![0, 1]);
        assert_eq!(
            index.get(&Node::chunk_id_for("doc-1", 0)).unwrap().text,
            "# Title\n\npara one."
        );

        let record = state.get_document("doc-1").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Completed);
        assert_eq!(record.node_count, 2);

        let doc_state = state.load_state("doc-1").await.unwrap().unwrap();
        assert_eq!(doc_state.chunk_ids.len(), 2);
        assert_eq!(doc_state.file_hash, hashing::hash_text(text));
    }

    #[tokio::test]
    async fn test_node_metadata_carries_structure() {
        let embedder: Arc<dyn Embedder> = Arc::new(MockEmbedder::new(32));
        let chunks = chunking::chunk(
            "# H\n\nbody text",
            &crate::chunking::ChunkingParams {
                kind: crate::chunking::ChunkKind::RecursiveMarkdown,
                ..Default::default()
            },
        );
        let nodes = build_nodes(
            &embedder,
            "d1",
            FileType::Md,
            "primary",
            &json!({"title": "Doc"}),
            &chunks,
            0,
            &no_cancel(),
        )
        .await
        .unwrap();

        assert_eq!(nodes.len(), 1);
        let meta = &nodes[0].metadata;
        assert_eq!(meta["file_type"], json!("md"));
        assert_eq!(meta["heading_path"], json!(["H"]));
        assert_eq!(meta["title"], json!("Doc"));
        assert_eq!(meta["datasource"], json!("primary"));
    }
}
