//! Configuration management for CorpusForge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/<env>, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Relational store (documents + document states)
    pub database: DatabaseConfig,

    /// Embedding service configuration
    pub embedding: EmbeddingConfig,

    /// Vector store configuration
    pub vector_store: VectorStoreConfig,

    /// Chunking defaults
    pub chunking: ChunkingConfig,

    /// Parallel/segmented execution
    pub parallel: ParallelConfig,

    /// Incremental re-ingest behavior
    pub incremental: IncrementalConfig,

    /// Retrieval weights and reranking
    pub retrieval: RetrievalConfig,

    /// Task broker configuration
    pub broker: BrokerConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL; `memory` selects the in-memory state store
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, dashscope, custom, mock
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for the embedding service
    pub api_key: Option<String>,

    /// API base URL (required for `custom`, optional otherwise)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension; must match the index dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Maximum texts per embed call
    #[serde(default = "default_embed_batch_max")]
    pub batch_max: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries for transient failures
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorStoreConfig {
    /// Backend: pgvector, memory (milvus/elasticsearch/faiss/qdrant are
    /// recognized names but have no in-tree adapter)
    #[serde(default = "default_vector_backend")]
    pub backend: String,

    /// Connection endpoint (backend-specific; pgvector reuses database.url
    /// when unset)
    pub endpoint: Option<String>,

    /// Collection (table) name
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Startup behavior: create_if_not_exists or no_validation
    #[serde(default = "default_index_management")]
    pub index_management: String,

    /// Drop and recreate the collection at startup
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkingConfig {
    /// Target chunk size in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Overlap between adjacent chunks in characters
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Default chunking kind when the analyzer has no stronger signal:
    /// semantic, fixed, recursive_markdown, hierarchical, code_aware,
    /// table_aware
    #[serde(default = "default_chunking_type")]
    pub chunking_type: String,

    /// Respect markdown structure in non-markdown text
    #[serde(default = "default_true")]
    pub respect_markdown: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParallelConfig {
    /// Enable the parallel/segmented executor for large documents
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum concurrent segment workers
    #[serde(default = "default_parallel_workers")]
    pub max_workers: usize,

    /// Segment size in characters
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,

    /// Segment split strategy: fixed_size, sentence, paragraph, semantic
    #[serde(default = "default_parallel_strategy")]
    pub strategy: String,

    /// Recognized for parity with distributed deployments; the in-process
    /// broker ignores it
    #[serde(default)]
    pub use_distributed: bool,

    /// Bound in-flight segments instead of dispatching all at once
    #[serde(default)]
    pub memory_efficient: bool,

    /// In-flight segment bound when memory_efficient is set
    #[serde(default = "default_parallel_batch")]
    pub batch_size: usize,

    /// Documents at or above this byte size go parallel
    #[serde(default = "default_parallel_threshold")]
    pub threshold_bytes: u64,

    /// Documents at or above this token estimate go parallel
    #[serde(default = "default_token_threshold")]
    pub token_threshold: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IncrementalConfig {
    /// Enable delta detection on re-ingest
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delta ratio at or above which the whole document is reprocessed
    #[serde(default = "default_force_reprocess_threshold")]
    pub force_reprocess_threshold: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Weight of the normalized vector score in fusion
    #[serde(default = "default_w_vector")]
    pub w_vector: f32,

    /// Weight of the normalized lexical score in fusion
    #[serde(default = "default_w_lexical")]
    pub w_lexical: f32,

    /// Cross-encoder model identifier: builtin, or a remote model name
    #[serde(default = "default_rerank_model")]
    pub rerank_model: String,

    /// How many fused results go through the reranker
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,

    /// Rerank service endpoint (remote models)
    pub rerank_api_base: Option<String>,

    /// Rerank service API key
    pub rerank_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Broker URL; recognized for distributed deployments, unused by the
    /// in-process runtime
    pub broker_url: Option<String>,

    /// Result backend URL; same note as broker_url
    pub result_backend_url: Option<String>,

    /// Hard per-task time limit in seconds
    #[serde(default = "default_task_time_limit")]
    pub task_time_limit_secs: u64,

    /// Soft per-task time limit in seconds
    #[serde(default = "default_task_soft_time_limit")]
    pub task_soft_time_limit_secs: u64,

    /// Maximum retries per task
    #[serde(default = "default_task_retries")]
    pub max_retries: u32,

    /// Concurrent workers per queue
    #[serde(default = "default_broker_workers")]
    pub workers_per_queue: usize,

    /// Tasks a worker slot handles before recycling; recognized, advisory
    #[serde(default = "default_max_tasks_per_child")]
    pub worker_max_tasks_per_child: u32,

    /// Prefetch multiplier; recognized, advisory
    #[serde(default = "default_prefetch_multiplier")]
    pub worker_prefetch_multiplier: u32,

    /// Acknowledge tasks only after success
    #[serde(default = "default_true")]
    pub task_acks_late: bool,

    /// Seconds to retain finished task records and results
    #[serde(default = "default_result_ttl")]
    pub result_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_true")]
    pub json_logging: bool,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_database_url() -> String {
    "memory".to_string()
}
fn default_max_connections() -> u32 {
    50
}
fn default_min_connections() -> u32 {
    5
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embedding_dimension() -> usize {
    1536
}
fn default_embed_batch_max() -> usize {
    100
}
fn default_embedding_timeout() -> u64 {
    30
}
fn default_embedding_retries() -> u32 {
    3
}
fn default_vector_backend() -> String {
    "pgvector".to_string()
}
fn default_collection() -> String {
    "corpus_chunks".to_string()
}
fn default_index_management() -> String {
    "create_if_not_exists".to_string()
}
fn default_chunk_size() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    20
}
fn default_chunking_type() -> String {
    "semantic".to_string()
}
fn default_true() -> bool {
    true
}
fn default_parallel_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| (n.get() * 2).min(32))
        .unwrap_or(8)
}
fn default_segment_size() -> usize {
    100_000
}
fn default_parallel_strategy() -> String {
    "sentence".to_string()
}
fn default_parallel_batch() -> usize {
    10
}
fn default_parallel_threshold() -> u64 {
    1024 * 1024
}
fn default_token_threshold() -> usize {
    200_000
}
fn default_force_reprocess_threshold() -> f64 {
    0.5
}
fn default_w_vector() -> f32 {
    0.7
}
fn default_w_lexical() -> f32 {
    0.3
}
fn default_rerank_model() -> String {
    "builtin".to_string()
}
fn default_rerank_top_n() -> usize {
    20
}
fn default_task_time_limit() -> u64 {
    360
}
fn default_task_soft_time_limit() -> u64 {
    300
}
fn default_task_retries() -> u32 {
    3
}
fn default_broker_workers() -> usize {
    4
}
fn default_max_tasks_per_child() -> u32 {
    1000
}
fn default_prefetch_multiplier() -> u32 {
    4
}
fn default_result_ttl() -> u64 {
    3600
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_service_name() -> String {
    "corpusforge".to_string()
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{env}")).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__CHUNKING__CHUNK_SIZE=1024
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get the embedding request timeout as a Duration
    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding.timeout_secs)
    }

    /// Get the hard task time limit as a Duration
    pub fn task_time_limit(&self) -> Duration {
        Duration::from_secs(self.broker.task_time_limit_secs)
    }

    /// Get the soft task time limit as a Duration
    pub fn task_soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.broker.task_soft_time_limit_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        // serde defaults double as the programmatic defaults
        serde_json::from_value(serde_json::json!({
            "database": {},
            "embedding": {},
            "vector_store": {},
            "chunking": {},
            "parallel": {},
            "incremental": {},
            "retrieval": {},
            "broker": {},
            "observability": {},
        }))
        .expect("default config is deserializable")
    }
}
