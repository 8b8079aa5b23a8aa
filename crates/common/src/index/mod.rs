//! Vector index adapters
//!
//! The index exclusively owns persisted chunks (nodes). Adapters implement
//! a narrow contract: idempotent upsert keyed by chunk id, deletion by
//! document or by ids, dense vector search, and lexical search where the
//! backend supports it.
//!
//! The filter language is deliberately the minimal subset shared by the
//! supported backends: equality and `in` over metadata fields. Anything
//! richer is refused rather than approximated.

mod memory;
mod pg;

pub use memory::MemoryIndex;
pub use pg::PgVectorIndex;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::VectorStoreConfig;
use crate::db::DbPool;
use crate::errors::{AppError, Result};

/// A chunk as persisted in the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique id, derived from the owning document and ordinal
    pub chunk_id: String,
    pub doc_id: String,
    /// 0-based position within the document
    pub ordinal: usize,
    pub text: String,
    pub embedding: Vec<f32>,
    /// file_type, heading_path, boundary_kind, offsets, datasource, ...
    pub metadata: Value,
    /// Hash of `text`
    pub content_hash: String,
}

impl Node {
    /// Deterministic chunk id: same document and ordinal always map to the
    /// same id, which is what makes upserts idempotent across re-ingests.
    pub fn chunk_id_for(doc_id: &str, ordinal: usize) -> String {
        format!("{doc_id}:{ordinal:06}")
    }
}

/// A single equality or inclusion constraint over node metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterClause {
    Eq { field: String, value: Value },
    In { field: String, values: Vec<Value> },
}

/// Conjunction of filter clauses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub clauses: Vec<FilterClause>,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            clauses: vec![FilterClause::Eq {
                field: field.into(),
                value: value.into(),
            }],
        }
    }

    pub fn and_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(FilterClause::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Parse the caller-facing JSON filter shape:
    /// `{"file_type": "md", "tag": {"in": ["a", "b"]}}`.
    ///
    /// Any other operator shape is refused.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| AppError::UnsupportedFilter {
            message: "filter must be a JSON object".to_string(),
        })?;

        let mut clauses = Vec::with_capacity(obj.len());
        for (field, spec) in obj {
            match spec {
                Value::Object(map) => {
                    if map.len() == 1 {
                        if let Some(Value::Array(values)) = map.get("in") {
                            clauses.push(FilterClause::In {
                                field: field.clone(),
                                values: values.clone(),
                            });
                            continue;
                        }
                    }
                    return Err(AppError::UnsupportedFilter {
                        message: format!(
                            "field '{field}' uses an unsupported operator; only equality and 'in' are available"
                        ),
                    });
                }
                Value::Array(_) => {
                    return Err(AppError::UnsupportedFilter {
                        message: format!("field '{field}': use {{\"in\": [...]}} for inclusion"),
                    });
                }
                other => clauses.push(FilterClause::Eq {
                    field: field.clone(),
                    value: other.clone(),
                }),
            }
        }

        Ok(Self { clauses })
    }

    /// Evaluate against a node's metadata (plus its intrinsic doc_id).
    pub fn matches(&self, doc_id: &str, metadata: &Value) -> bool {
        let lookup = |field: &str| -> Option<Value> {
            if field == "doc_id" {
                Some(Value::String(doc_id.to_string()))
            } else {
                metadata.get(field).cloned()
            }
        };

        self.clauses.iter().all(|clause| match clause {
            FilterClause::Eq { field, value } => {
                lookup(field).map(|v| v == *value).unwrap_or(false)
            }
            FilterClause::In { field, values } => {
                lookup(field).map(|v| values.contains(&v)).unwrap_or(false)
            }
        })
    }
}

/// A search hit with score and optional lexical match spans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredNode {
    pub chunk_id: String,
    pub doc_id: String,
    pub ordinal: usize,
    pub text: String,
    pub metadata: Value,
    pub score: f32,
    /// Byte spans of matched terms; lexical search only, empty elsewhere
    pub spans: Vec<(usize, usize)>,
}

/// Collection bootstrap behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexManagement {
    CreateIfNotExists,
    NoValidation,
}

impl IndexManagement {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "create_if_not_exists" => Ok(IndexManagement::CreateIfNotExists),
            "no_validation" => Ok(IndexManagement::NoValidation),
            other => Err(AppError::Configuration {
                message: format!("unknown index management mode: {other}"),
            }),
        }
    }
}

/// Narrow contract over the vector store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Bootstrap the collection. `CreateIfNotExists` creates the schema;
    /// `NoValidation` assumes it exists.
    async fn ensure_collection(
        &self,
        name: &str,
        dim: usize,
        management: IndexManagement,
    ) -> Result<()>;

    /// Insert or replace nodes by chunk id. Idempotent per node.
    async fn upsert(&self, nodes: &[Node]) -> Result<()>;

    /// Remove all chunks of a document. Returns how many were removed.
    async fn delete_by_doc(&self, doc_id: &str) -> Result<usize>;

    /// Remove specific chunks. Missing ids are not an error.
    async fn delete_by_ids(&self, chunk_ids: &[String]) -> Result<usize>;

    async fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredNode>>;

    async fn lexical_search(
        &self,
        terms: &[String],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredNode>>;

    /// Number of chunks persisted for a document.
    async fn count_by_doc(&self, doc_id: &str) -> Result<usize>;
}

/// Create a vector index from configuration.
pub fn create_index(config: &VectorStoreConfig, pool: Option<DbPool>) -> Result<Arc<dyn VectorIndex>> {
    match config.backend.as_str() {
        "pgvector" => {
            let pool = pool.ok_or_else(|| AppError::Configuration {
                message: "pgvector backend requires a database connection".to_string(),
            })?;
            Ok(Arc::new(PgVectorIndex::new(pool, config.collection.clone())))
        }
        "memory" => Ok(Arc::new(MemoryIndex::new())),
        // Recognized names without an in-tree adapter
        "milvus" | "elasticsearch" | "faiss" | "qdrant" => Err(AppError::Configuration {
            message: format!("vector store backend '{}' has no adapter in this build", config.backend),
        }),
        other => Err(AppError::Configuration {
            message: format!("unknown vector store backend: {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chunk_id_is_deterministic_and_ordered() {
        assert_eq!(Node::chunk_id_for("doc", 0), "doc:000000");
        assert_eq!(Node::chunk_id_for("doc", 42), "doc:000042");
        assert!(Node::chunk_id_for("doc", 2) < Node::chunk_id_for("doc", 10));
    }

    #[test]
    fn test_filter_parse_eq_and_in() {
        let filter = Filter::from_json(&json!({
            "file_type": "md",
            "tag": {"in": ["a", "b"]}
        }))
        .unwrap();
        assert_eq!(filter.clauses.len(), 2);

        assert!(filter.matches("d", &json!({"file_type": "md", "tag": "b"})));
        assert!(!filter.matches("d", &json!({"file_type": "md", "tag": "c"})));
        assert!(!filter.matches("d", &json!({"file_type": "pdf", "tag": "a"})));
    }

    #[test]
    fn test_filter_refuses_unknown_operators() {
        assert!(Filter::from_json(&json!({"size": {"gt": 10}})).is_err());
        assert!(Filter::from_json(&json!({"tag": ["a", "b"]})).is_err());
        assert!(Filter::from_json(&json!("not an object")).is_err());
    }

    #[test]
    fn test_filter_on_doc_id() {
        let filter = Filter::eq("doc_id", "d1");
        assert!(filter.matches("d1", &json!({})));
        assert!(!filter.matches("d2", &json!({})));
    }
}
