//! CorpusForge ingestion
//!
//! The document-ingestion pipeline: adaptive analysis, the chunker
//! family, the processor pipeline, the parallel segmented executor, and
//! the incremental update manager, fronted by [`service::IngestionService`].

pub mod analyzer;
pub mod chunking;
pub mod incremental;
pub mod parallel;
pub mod pipeline;
pub mod service;

pub use analyzer::{Analyzer, Complexity, DocumentFeatures, PlanOverrides, ProcessingPlan};
pub use chunking::{BoundaryKind, ChunkKind, ChunkPiece, ChunkingParams, Language};
pub use incremental::{IncrementalManager, IncrementalOutcome};
pub use parallel::{ParallelExecutor, Segment};
pub use pipeline::{Context, Pipeline, Processor, ProcessorRegistry, Stage, StageOutcome};
pub use service::IngestionService;
