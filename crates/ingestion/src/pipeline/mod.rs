//! Pipeline engine
//!
//! A pipeline is an ordered list of processors, each taking the typed
//! `Context` and returning it mutated. The engine enforces the stage
//! order Validate → MarkdownNormalize (optional) → Chunk → Embed → Index
//! → Finalize, selects processors by file type from an explicit registry
//! (populated at startup, no reflection), and surfaces the first failure
//! with the stage name and, when known, the offending chunk ordinal.

pub mod processors;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use corpusforge_common::errors::{AppError, Result};
use corpusforge_common::index::Node;
use corpusforge_common::state::FileType;

use crate::analyzer::ProcessingPlan;
use crate::chunking::ChunkPiece;

/// Canonical stage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Validate,
    Normalize,
    Chunk,
    Embed,
    Index,
    Finalize,
}

impl Stage {
    pub const ORDER: [Stage; 6] = [
        Stage::Validate,
        Stage::Normalize,
        Stage::Chunk,
        Stage::Embed,
        Stage::Index,
        Stage::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Normalize => "markdown_normalize",
            Stage::Chunk => "chunk",
            Stage::Embed => "embed",
            Stage::Index => "index",
            Stage::Finalize => "finalize",
        }
    }
}

/// Cooperative cancellation probe, checked between stages and around I/O.
pub type CancelCheck = Arc<dyn Fn() -> Result<()> + Send + Sync>;

pub fn no_cancel() -> CancelCheck {
    Arc::new(|| Ok(()))
}

/// Result of a completed pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed {
        node_count: usize,
    },
    /// Re-ingest with identical content; nothing touched
    Unchanged {
        node_count: usize,
    },
    /// Incremental update
    Updated {
        added: usize,
        removed: usize,
        unchanged: usize,
        node_count: usize,
    },
    /// Some segments failed but `allow_partial` kept the rest
    Partial {
        node_count: usize,
        failed_segments: Vec<usize>,
    },
}

impl StageOutcome {
    pub fn node_count(&self) -> usize {
        match self {
            StageOutcome::Completed { node_count }
            | StageOutcome::Unchanged { node_count }
            | StageOutcome::Updated { node_count, .. }
            | StageOutcome::Partial { node_count, .. } => *node_count,
        }
    }
}

/// Mutable per-document processing context, passed by exclusive handoff
/// between stages.
#[derive(Clone)]
pub struct Context {
    pub doc_id: String,
    pub source_path: String,
    pub file_type: FileType,
    /// Document-level metadata (title, tags, datasource name, ...)
    pub metadata: Value,
    pub plan: ProcessingPlan,
    pub size_bytes: u64,
    pub file_hash: String,
    pub cancel: CancelCheck,

    /// Decoded source text (set before Validate)
    pub text: String,
    /// Normalized markdown, when the plan asks for it
    pub markdown: Option<String>,
    /// Chunk stage output
    pub chunks: Vec<ChunkPiece>,
    /// Embed stage output
    pub nodes: Vec<Node>,
    /// Set by Finalize
    pub outcome: Option<StageOutcome>,
}

impl Context {
    /// The text later stages operate on: normalized markdown when
    /// present, raw text otherwise.
    pub fn content(&self) -> &str {
        self.markdown.as_deref().unwrap_or(&self.text)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("doc_id", &self.doc_id)
            .field("source_path", &self.source_path)
            .field("file_type", &self.file_type)
            .field("metadata", &self.metadata)
            .field("plan", &self.plan)
            .field("size_bytes", &self.size_bytes)
            .field("file_hash", &self.file_hash)
            .field("text", &self.text)
            .field("markdown", &self.markdown)
            .field("chunks", &self.chunks)
            .field("nodes", &self.nodes)
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// A processor mutates the context and hands it to the next stage.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;
    fn stage(&self) -> Stage;
    /// File types this processor handles
    fn supports(&self, _file_type: FileType) -> bool {
        true
    }
    async fn process(&self, ctx: Context) -> Result<Context>;
}

/// Explicit processor registry: name → processor, with declared supported
/// file types. Later registrations for the same stage take precedence, so
/// deployments can override a default processor by registering their own.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: Vec<Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        tracing::debug!(
            processor = processor.name(),
            stage = processor.stage().as_str(),
            "Registered processor"
        );
        self.processors.push(processor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Processor>> {
        self.processors
            .iter()
            .rev()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Build the pipeline for a document: for each stage in canonical
    /// order, the most recently registered processor that supports the
    /// file type. The normalize stage is skipped unless the plan asks
    /// for markdown conversion.
    pub fn pipeline_for(&self, file_type: FileType, plan: &ProcessingPlan) -> Result<Pipeline> {
        let mut selected = Vec::new();
        for stage in Stage::ORDER {
            if stage == Stage::Normalize && !plan.convert_to_markdown {
                continue;
            }
            let processor = self
                .processors
                .iter()
                .rev()
                .find(|p| p.stage() == stage && p.supports(file_type));
            match processor {
                Some(p) => selected.push(p.clone()),
                None => {
                    return Err(AppError::Configuration {
                        message: format!(
                            "no processor registered for stage '{}' and file type '{}'",
                            stage.as_str(),
                            file_type
                        ),
                    })
                }
            }
        }
        Ok(Pipeline {
            processors: selected,
        })
    }
}

/// An ordered chain of processors.
pub struct Pipeline {
    processors: Vec<Arc<dyn Processor>>,
}

impl Pipeline {
    pub fn stages(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Run every stage in order. The first failure is surfaced with its
    /// stage name attached.
    pub async fn run(&self, mut ctx: Context) -> Result<Context> {
        for processor in &self.processors {
            (ctx.cancel)()?;
            let name = processor.name();
            tracing::debug!(doc_id = %ctx.doc_id, stage = name, "Running pipeline stage");
            ctx = processor.process(ctx).await.map_err(|e| match e {
                // Stage-tagged errors pass through untouched
                AppError::Stage { .. } => e,
                other => other.in_stage(name, None),
            })?;
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use corpusforge_common::config::AppConfig;

    struct Nop(Stage, &'static str);

    #[async_trait]
    impl Processor for Nop {
        fn name(&self) -> &'static str {
            self.1
        }
        fn stage(&self) -> Stage {
            self.0
        }
        async fn process(&self, ctx: Context) -> Result<Context> {
            Ok(ctx)
        }
    }

    fn plan(convert: bool) -> ProcessingPlan {
        let analyzer = Analyzer::new(AppConfig::default());
        let (_, mut plan) = analyzer
            .analyze(FileType::Txt, "some text for planning.", 23)
            .unwrap();
        plan.convert_to_markdown = convert;
        plan
    }

    fn full_registry() -> ProcessorRegistry {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(Nop(Stage::Validate, "validate")));
        registry.register(Arc::new(Nop(Stage::Normalize, "markdown_normalize")));
        registry.register(Arc::new(Nop(Stage::Chunk, "chunk")));
        registry.register(Arc::new(Nop(Stage::Embed, "embed")));
        registry.register(Arc::new(Nop(Stage::Index, "index")));
        registry.register(Arc::new(Nop(Stage::Finalize, "finalize")));
        registry
    }

    #[test]
    fn test_pipeline_respects_stage_order_and_plan() {
        let registry = full_registry();

        let with_normalize = registry
            .pipeline_for(FileType::Pdf, &plan(true))
            .unwrap();
        assert_eq!(
            with_normalize.stages(),
            vec![
                "validate",
                "markdown_normalize",
                "chunk",
                "embed",
                "index",
                "finalize"
            ]
        );

        let without = registry.pipeline_for(FileType::Txt, &plan(false)).unwrap();
        assert_eq!(
            without.stages(),
            vec!["validate", "chunk", "embed", "index", "finalize"]
        );
    }

    #[test]
    fn test_missing_stage_is_a_config_error() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(Nop(Stage::Validate, "validate")));
        assert!(registry.pipeline_for(FileType::Txt, &plan(false)).is_err());
    }

    #[test]
    fn test_later_registration_wins() {
        let mut registry = full_registry();
        registry.register(Arc::new(Nop(Stage::Chunk, "custom_chunk")));
        let pipeline = registry.pipeline_for(FileType::Txt, &plan(false)).unwrap();
        assert!(pipeline.stages().contains(&"custom_chunk"));
        assert!(!pipeline.stages().contains(&"chunk"));
    }

    #[tokio::test]
    async fn test_failure_carries_stage_name() {
        struct Failing;

        #[async_trait]
        impl Processor for Failing {
            fn name(&self) -> &'static str {
                "embed"
            }
            fn stage(&self) -> Stage {
                Stage::Embed
            }
            async fn process(&self, _ctx: Context) -> Result<Context> {
                Err(AppError::EmbedFatal {
                    message: "boom".into(),
                })
            }
        }

        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(Nop(Stage::Validate, "validate")));
        registry.register(Arc::new(Nop(Stage::Chunk, "chunk")));
        registry.register(Arc::new(Failing));
        registry.register(Arc::new(Nop(Stage::Index, "index")));
        registry.register(Arc::new(Nop(Stage::Finalize, "finalize")));

        let pipeline = registry.pipeline_for(FileType::Txt, &plan(false)).unwrap();
        let ctx = Context {
            doc_id: "d1".into(),
            source_path: "mem://d1".into(),
            file_type: FileType::Txt,
            metadata: serde_json::json!({}),
            plan: plan(false),
            size_bytes: 0,
            file_hash: String::new(),
            cancel: no_cancel(),
            text: "content".into(),
            markdown: None,
            chunks: Vec::new(),
            nodes: Vec::new(),
            outcome: None,
        };

        let err = pipeline.run(ctx).await.unwrap_err();
        assert!(err.to_string().contains("stage 'embed'"));
    }
}
