//! CorpusForge Common Library
//!
//! Shared code for the CorpusForge services:
//! - Configuration management
//! - Error taxonomy with transient/fatal classification
//! - Content hashing and the document state store
//! - Embedding client abstraction
//! - Vector index adapters
//! - The task broker
//! - Metrics and observability

pub mod broker;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod hashing;
pub mod index;
pub mod metrics;
pub mod source;
pub mod state;

// Re-export commonly used types
pub use broker::{TaskBroker, TaskRecord, TaskState};
pub use config::AppConfig;
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use index::{Filter, Node, ScoredNode, VectorIndex};
pub use state::{DocumentRecord, DocumentState, DocumentStatus, FileType, StateStore};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding dimension
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;
