//! In-memory state store for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{DocumentRecord, DocumentState, DocumentStatus, StateStore};
use crate::errors::{AppError, Result};

#[derive(Default)]
struct Inner {
    documents: HashMap<String, DocumentRecord>,
    states: HashMap<String, DocumentState>,
}

/// HashMap-backed `StateStore`. The single mutex doubles as the
/// compare-and-set point for the per-document lock.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn upsert_document(&self, doc: &DocumentRecord) -> Result<()> {
        let mut inner = self.inner.lock().expect("state lock");
        match inner.documents.get_mut(&doc.doc_id) {
            Some(existing) => {
                existing.source_path = doc.source_path.clone();
                existing.file_type = doc.file_type;
                existing.metadata = doc.metadata.clone();
                existing.size_bytes = doc.size_bytes;
            }
            None => {
                inner.documents.insert(doc.doc_id.clone(), doc.clone());
            }
        }
        Ok(())
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<DocumentRecord>> {
        Ok(self
            .inner
            .lock()
            .expect("state lock")
            .documents
            .get(doc_id)
            .cloned())
    }

    async fn try_begin_processing(&self, doc_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("state lock");
        let doc = inner
            .documents
            .get_mut(doc_id)
            .ok_or_else(|| AppError::DocumentNotFound {
                doc_id: doc_id.to_string(),
            })?;
        match doc.status {
            DocumentStatus::Processing | DocumentStatus::Canceling => {
                Err(AppError::DocumentBusy {
                    doc_id: doc_id.to_string(),
                })
            }
            _ => {
                doc.status = DocumentStatus::Processing;
                doc.error = None;
                Ok(())
            }
        }
    }

    async fn finish_processing(
        &self,
        doc_id: &str,
        status: DocumentStatus,
        node_count: Option<usize>,
        error: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("state lock");
        let doc = inner
            .documents
            .get_mut(doc_id)
            .ok_or_else(|| AppError::DocumentNotFound {
                doc_id: doc_id.to_string(),
            })?;
        doc.status = status;
        if let Some(count) = node_count {
            doc.node_count = count;
        }
        doc.error = error;
        if status.is_terminal() {
            doc.last_processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn request_cancel(&self, doc_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().expect("state lock");
        let doc = inner
            .documents
            .get_mut(doc_id)
            .ok_or_else(|| AppError::DocumentNotFound {
                doc_id: doc_id.to_string(),
            })?;
        if doc.status == DocumentStatus::Processing {
            doc.status = DocumentStatus::Canceling;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn load_state(&self, doc_id: &str) -> Result<Option<DocumentState>> {
        Ok(self
            .inner
            .lock()
            .expect("state lock")
            .states
            .get(doc_id)
            .cloned())
    }

    async fn save_state(&self, state: &DocumentState) -> Result<()> {
        self.inner
            .lock()
            .expect("state lock")
            .states
            .insert(state.doc_id.clone(), state.clone());
        Ok(())
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("state lock");
        inner.documents.remove(doc_id);
        inner.states.remove(doc_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str) -> DocumentRecord {
        DocumentRecord::new(id, format!("/tmp/{id}.md"), crate::state::FileType::Md)
    }

    #[tokio::test]
    async fn test_processing_lock_excludes_second_ingest() {
        let store = MemoryStateStore::new();
        store.upsert_document(&doc("d1")).await.unwrap();

        store.try_begin_processing("d1").await.unwrap();
        let err = store.try_begin_processing("d1").await.unwrap_err();
        assert!(matches!(err, AppError::DocumentBusy { .. }));

        store
            .finish_processing("d1", DocumentStatus::Completed, Some(3), None)
            .await
            .unwrap();
        // Lock released; a re-ingest may begin
        store.try_begin_processing("d1").await.unwrap();
    }

    #[tokio::test]
    async fn test_finish_records_count_and_time() {
        let store = MemoryStateStore::new();
        store.upsert_document(&doc("d1")).await.unwrap();
        store.try_begin_processing("d1").await.unwrap();
        store
            .finish_processing("d1", DocumentStatus::Completed, Some(7), None)
            .await
            .unwrap();

        let rec = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(rec.status, DocumentStatus::Completed);
        assert_eq!(rec.node_count, 7);
        assert!(rec.last_processed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_only_when_processing() {
        let store = MemoryStateStore::new();
        store.upsert_document(&doc("d1")).await.unwrap();
        assert!(!store.request_cancel("d1").await.unwrap());
        store.try_begin_processing("d1").await.unwrap();
        assert!(store.request_cancel("d1").await.unwrap());
        let rec = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(rec.status, DocumentStatus::Canceling);
    }

    #[tokio::test]
    async fn test_state_blob_roundtrip_and_purge() {
        let store = MemoryStateStore::new();
        store.upsert_document(&doc("d1")).await.unwrap();
        let state = DocumentState {
            doc_id: "d1".into(),
            file_hash: "abc".into(),
            chunk_hashes: vec!["h0".into(), "h1".into()],
            chunk_ids: vec!["d1:000000".into(), "d1:000001".into()],
            last_processed_at: Utc::now(),
            metadata_snapshot: serde_json::json!({"title": "t"}),
        };
        store.save_state(&state).await.unwrap();
        assert_eq!(store.load_state("d1").await.unwrap().unwrap(), state);

        store.delete_document("d1").await.unwrap();
        assert!(store.get_document("d1").await.unwrap().is_none());
        assert!(store.load_state("d1").await.unwrap().is_none());
    }
}
