//! Document metadata and processing state (the state store).
//!
//! The state store owns two things:
//! - the `Document` record (status, node count, error) visible to callers,
//! - the `DocumentState` blob (file hash, chunk hashes, chunk ids) used by
//!   the incremental update manager.
//!
//! It also provides the per-document processing lock: a compare-and-set on
//! `status` so that two concurrent ingests of the same document serialize,
//! the loser failing with `DocumentBusy`.

mod memory;
mod sql;

pub use memory::MemoryStateStore;
pub use sql::SqlStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;

/// Source document types the analyzer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Pdf,
    Docx,
    Md,
    Txt,
    Code,
    Html,
    Table,
    Other,
}

impl FileType {
    /// Classify by file extension.
    pub fn from_path(path: &str) -> Self {
        let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => FileType::Pdf,
            "docx" | "doc" => FileType::Docx,
            "md" | "markdown" => FileType::Md,
            "txt" | "text" | "log" => FileType::Txt,
            "html" | "htm" => FileType::Html,
            "csv" | "tsv" | "xlsx" | "xls" => FileType::Table,
            "rs" | "py" | "js" | "ts" | "go" | "java" | "c" | "cpp" | "h" | "rb" | "sh"
            | "sql" | "toml" | "yaml" | "yml" | "json" => FileType::Code,
            _ => FileType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Md => "md",
            FileType::Txt => "txt",
            FileType::Code => "code",
            FileType::Html => "html",
            FileType::Table => "table",
            FileType::Other => "other",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Partial,
    Canceling,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Partial => "partial",
            DocumentStatus::Canceling => "canceling",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => DocumentStatus::Processing,
            "completed" => DocumentStatus::Completed,
            "partial" => DocumentStatus::Partial,
            "canceling" => DocumentStatus::Canceling,
            "failed" => DocumentStatus::Failed,
            _ => DocumentStatus::Pending,
        }
    }

    /// Terminal states do not hold the per-document lock.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Completed | DocumentStatus::Partial | DocumentStatus::Failed
        )
    }
}

/// Caller-visible document record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub doc_id: String,
    pub source_path: String,
    pub file_type: FileType,
    pub metadata: Value,
    pub status: DocumentStatus,
    pub size_bytes: u64,
    pub node_count: usize,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DocumentRecord {
    pub fn new(doc_id: impl Into<String>, source_path: impl Into<String>, file_type: FileType) -> Self {
        Self {
            doc_id: doc_id.into(),
            source_path: source_path.into(),
            file_type,
            metadata: Value::Object(Default::default()),
            status: DocumentStatus::Pending,
            size_bytes: 0,
            node_count: 0,
            last_processed_at: None,
            error: None,
        }
    }
}

/// Per-document ingest state used by the incremental path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    pub doc_id: String,
    pub file_hash: String,
    pub chunk_hashes: Vec<String>,
    pub chunk_ids: Vec<String>,
    pub last_processed_at: DateTime<Utc>,
    pub metadata_snapshot: Value,
}

/// State store contract: Document CRUD, DocumentState blobs, and the
/// per-document processing lock.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a document record, or update source path/type/metadata if it
    /// already exists.
    async fn upsert_document(&self, doc: &DocumentRecord) -> Result<()>;

    async fn get_document(&self, doc_id: &str) -> Result<Option<DocumentRecord>>;

    /// Acquire the per-document lock by moving status to `processing`.
    /// Fails with `DocumentBusy` when another ingest holds it.
    async fn try_begin_processing(&self, doc_id: &str) -> Result<()>;

    /// Release the lock with a terminal (or canceling) status, updating
    /// node count and error message.
    async fn finish_processing(
        &self,
        doc_id: &str,
        status: DocumentStatus,
        node_count: Option<usize>,
        error: Option<String>,
    ) -> Result<()>;

    /// Mark a running ingest as canceling. No-op unless processing.
    async fn request_cancel(&self, doc_id: &str) -> Result<bool>;

    async fn load_state(&self, doc_id: &str) -> Result<Option<DocumentState>>;

    /// Atomically replace the DocumentState blob.
    async fn save_state(&self, state: &DocumentState) -> Result<()>;

    /// Remove the record and state blob (document purge).
    async fn delete_document(&self, doc_id: &str) -> Result<()>;
}
