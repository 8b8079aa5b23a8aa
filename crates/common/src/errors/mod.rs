//! Error types for CorpusForge services
//!
//! Provides a shared error taxonomy with:
//! - Distinct error types for different failure modes
//! - Machine-readable error codes
//! - A transient/fatal split that drives retry decisions in the broker,
//!   the embedder clients, and the pipeline engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    UnsupportedFileType,
    EmptyDocument,
    InvalidQuery,
    UnsupportedFilter,

    // Resource errors (4xxx)
    NotFound,
    DocumentNotFound,
    TaskNotFound,

    // Conflict errors (5xxx)
    DocumentBusy,

    // Store errors (7xxx)
    StoreTransient,
    StoreFatal,

    // External service errors (8xxx)
    EmbedTransient,
    EmbedFatal,
    BrokerTransient,
    RerankError,

    // Execution errors (9xxx)
    SegmentFailure,
    Canceled,
    SoftTimeout,
    HardTimeout,
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::UnsupportedFileType => 1002,
            ErrorCode::EmptyDocument => 1003,
            ErrorCode::InvalidQuery => 1004,
            ErrorCode::UnsupportedFilter => 1005,

            // Resources (4xxx)
            ErrorCode::NotFound => 4001,
            ErrorCode::DocumentNotFound => 4002,
            ErrorCode::TaskNotFound => 4003,

            // Conflicts (5xxx)
            ErrorCode::DocumentBusy => 5001,

            // Store (7xxx)
            ErrorCode::StoreTransient => 7001,
            ErrorCode::StoreFatal => 7002,

            // External (8xxx)
            ErrorCode::EmbedTransient => 8001,
            ErrorCode::EmbedFatal => 8002,
            ErrorCode::BrokerTransient => 8003,
            ErrorCode::RerankError => 8004,

            // Execution (9xxx)
            ErrorCode::SegmentFailure => 9001,
            ErrorCode::Canceled => 9002,
            ErrorCode::SoftTimeout => 9003,
            ErrorCode::HardTimeout => 9004,
            ErrorCode::InternalError => 9005,
            ErrorCode::ConfigurationError => 9006,
            ErrorCode::SerializationError => 9007,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors: reported, never retried
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Unsupported file type: {file_type}")]
    UnsupportedFileType { file_type: String },

    #[error("Empty document: {path}")]
    EmptyDocument { path: String },

    #[error("Invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("Unsupported filter: {message}")]
    UnsupportedFilter { message: String },

    // Resource errors
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    #[error("Document not found: {doc_id}")]
    DocumentNotFound { doc_id: String },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    // Conflict: another ingest holds the per-document lock
    #[error("Document busy: {doc_id} is already being processed")]
    DocumentBusy { doc_id: String },

    // Embedding service errors
    #[error("Transient embedding error: {message}")]
    EmbedTransient { message: String },

    #[error("Fatal embedding error: {message}")]
    EmbedFatal { message: String },

    // Store errors
    #[error("Transient store error: {message}")]
    StoreTransient { message: String },

    #[error("Fatal store error: {message}")]
    StoreFatal { message: String },

    // Broker errors
    #[error("Transient broker error: {message}")]
    BrokerTransient { message: String },

    #[error("Rerank error: {message}")]
    RerankError { message: String },

    // Execution errors
    #[error("Segment {ordinal} of document {doc_id} failed: {message}")]
    SegmentFailure {
        doc_id: String,
        ordinal: usize,
        message: String,
    },

    #[error("Canceled")]
    Canceled,

    #[error("Soft timeout after {limit_secs}s")]
    SoftTimeout { limit_secs: u64 },

    #[error("Hard timeout after {limit_secs}s")]
    HardTimeout { limit_secs: u64 },

    #[error("Pipeline stage '{stage}' failed{}: {source}", ordinal.map(|o| format!(" at ordinal {o}")).unwrap_or_default())]
    Stage {
        stage: &'static str,
        ordinal: Option<usize>,
        #[source]
        source: Box<AppError>,
    },

    // Infrastructure
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Wrap an error with the pipeline stage it surfaced from.
    pub fn in_stage(self, stage: &'static str, ordinal: Option<usize>) -> Self {
        AppError::Stage {
            stage,
            ordinal,
            source: Box::new(self),
        }
    }

    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::UnsupportedFileType { .. } => ErrorCode::UnsupportedFileType,
            AppError::EmptyDocument { .. } => ErrorCode::EmptyDocument,
            AppError::InvalidQuery { .. } => ErrorCode::InvalidQuery,
            AppError::UnsupportedFilter { .. } => ErrorCode::UnsupportedFilter,
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::DocumentNotFound { .. } => ErrorCode::DocumentNotFound,
            AppError::TaskNotFound { .. } => ErrorCode::TaskNotFound,
            AppError::DocumentBusy { .. } => ErrorCode::DocumentBusy,
            AppError::EmbedTransient { .. } => ErrorCode::EmbedTransient,
            AppError::EmbedFatal { .. } => ErrorCode::EmbedFatal,
            AppError::StoreTransient { .. } => ErrorCode::StoreTransient,
            AppError::StoreFatal { .. } => ErrorCode::StoreFatal,
            AppError::BrokerTransient { .. } => ErrorCode::BrokerTransient,
            AppError::RerankError { .. } => ErrorCode::RerankError,
            AppError::SegmentFailure { .. } => ErrorCode::SegmentFailure,
            AppError::Canceled => ErrorCode::Canceled,
            AppError::SoftTimeout { .. } => ErrorCode::SoftTimeout,
            AppError::HardTimeout { .. } => ErrorCode::HardTimeout,
            AppError::Stage { source, .. } => source.code(),
            AppError::Database(_) => ErrorCode::StoreTransient,
            AppError::HttpClient(_) => ErrorCode::EmbedTransient,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Whether a retry with backoff can reasonably succeed.
    ///
    /// Validation errors, fatal service errors, cancellation and conflicts
    /// are never retried; network-shaped failures are.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::EmbedTransient { .. }
            | AppError::StoreTransient { .. }
            | AppError::BrokerTransient { .. }
            | AppError::SoftTimeout { .. }
            | AppError::Database(_)
            | AppError::HttpClient(_) => true,
            AppError::Stage { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// DocumentBusy is surfaced to the caller as retryable even though the
    /// broker must not spin on it.
    pub fn is_caller_retryable(&self) -> bool {
        matches!(self, AppError::DocumentBusy { .. }) || self.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::DocumentBusy {
            doc_id: "doc-1".into(),
        };
        assert_eq!(err.code(), ErrorCode::DocumentBusy);
        assert!(!err.is_transient());
        assert!(err.is_caller_retryable());
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::EmbedTransient {
            message: "429".into()
        }
        .is_transient());
        assert!(!AppError::EmbedFatal {
            message: "dimension mismatch".into()
        }
        .is_transient());
        assert!(!AppError::Canceled.is_transient());
    }

    #[test]
    fn test_stage_error_delegates() {
        let err = AppError::EmbedTransient {
            message: "quota".into(),
        }
        .in_stage("embed", Some(7));
        assert!(err.is_transient());
        assert_eq!(err.code(), ErrorCode::EmbedTransient);
        assert!(err.to_string().contains("ordinal 7"));
    }
}
