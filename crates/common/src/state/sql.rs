//! SQL-backed state store.
//!
//! Documents and DocumentState blobs live in two tables. The per-document
//! lock is a compare-and-set on `documents.status` executed as a single
//! UPDATE so that concurrent ingests of the same document serialize at the
//! database.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ColumnTrait, ConnectionTrait, DbBackend, EntityTrait, QueryFilter, Statement};

use super::{DocumentRecord, DocumentState, DocumentStatus, StateStore};
use crate::db::models::{DocumentEntity, DocumentStateColumn, DocumentStateEntity};
use crate::db::DbPool;
use crate::errors::{AppError, Result};

/// Repository over the `documents` and `document_states` tables.
#[derive(Clone)]
pub struct SqlStateStore {
    pool: DbPool,
}

impl SqlStateStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create the backing tables when they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        self.pool
            .execute_raw(
                r#"
                CREATE TABLE IF NOT EXISTS documents (
                    id TEXT PRIMARY KEY,
                    source_path TEXT NOT NULL,
                    file_type TEXT NOT NULL,
                    metadata JSONB NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'pending',
                    size_bytes BIGINT NOT NULL DEFAULT 0,
                    node_count INTEGER NOT NULL DEFAULT 0,
                    last_processed_at TIMESTAMPTZ,
                    error_message TEXT,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                );
                CREATE TABLE IF NOT EXISTS document_states (
                    doc_id TEXT PRIMARY KEY,
                    file_hash TEXT NOT NULL,
                    chunk_hashes JSONB NOT NULL,
                    chunk_ids JSONB NOT NULL,
                    last_processed_at TIMESTAMPTZ NOT NULL,
                    metadata_snapshot JSONB NOT NULL DEFAULT '{}'
                );
                "#,
            )
            .await
    }
}

#[async_trait]
impl StateStore for SqlStateStore {
    async fn upsert_document(&self, doc: &DocumentRecord) -> Result<()> {
        let now = Utc::now();

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            INSERT INTO documents (
                id, source_path, file_type, metadata, status, size_bytes,
                node_count, last_processed_at, error_message, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 0, NULL, NULL, $7, $7)
            ON CONFLICT (id) DO UPDATE SET
                source_path = EXCLUDED.source_path,
                file_type = EXCLUDED.file_type,
                metadata = EXCLUDED.metadata,
                size_bytes = EXCLUDED.size_bytes,
                updated_at = EXCLUDED.updated_at
            "#,
            vec![
                doc.doc_id.clone().into(),
                doc.source_path.clone().into(),
                doc.file_type.as_str().into(),
                doc.metadata.clone().into(),
                doc.status.as_str().into(),
                (doc.size_bytes as i64).into(),
                now.into(),
            ],
        );

        self.pool.conn().execute(stmt).await?;
        Ok(())
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<DocumentRecord>> {
        let row = DocumentEntity::find_by_id(doc_id.to_string())
            .one(self.pool.conn())
            .await?;
        Ok(row.map(|r| r.into_record()))
    }

    async fn try_begin_processing(&self, doc_id: &str) -> Result<()> {
        // CAS: only a document not currently processing may transition.
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE documents
            SET status = 'processing', error_message = NULL, updated_at = $2
            WHERE id = $1 AND status NOT IN ('processing', 'canceling')
            "#,
            vec![doc_id.into(), Utc::now().into()],
        );

        let result = self.pool.conn().execute(stmt).await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Distinguish busy from missing.
        match self.get_document(doc_id).await? {
            Some(_) => Err(AppError::DocumentBusy {
                doc_id: doc_id.to_string(),
            }),
            None => Err(AppError::DocumentNotFound {
                doc_id: doc_id.to_string(),
            }),
        }
    }

    async fn finish_processing(
        &self,
        doc_id: &str,
        status: DocumentStatus,
        node_count: Option<usize>,
        error: Option<String>,
    ) -> Result<()> {
        let now = Utc::now();
        let processed_at = status.is_terminal().then_some(now);

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE documents
            SET status = $2,
                node_count = COALESCE($3, node_count),
                error_message = $4,
                last_processed_at = COALESCE($5, last_processed_at),
                updated_at = $6
            WHERE id = $1
            "#,
            vec![
                doc_id.into(),
                status.as_str().into(),
                node_count.map(|c| c as i32).into(),
                error.into(),
                processed_at.into(),
                now.into(),
            ],
        );

        let result = self.pool.conn().execute(stmt).await?;
        if result.rows_affected() == 0 {
            return Err(AppError::DocumentNotFound {
                doc_id: doc_id.to_string(),
            });
        }
        Ok(())
    }

    async fn request_cancel(&self, doc_id: &str) -> Result<bool> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE documents
            SET status = 'canceling', updated_at = $2
            WHERE id = $1 AND status = 'processing'
            "#,
            vec![doc_id.into(), Utc::now().into()],
        );

        let result = self.pool.conn().execute(stmt).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn load_state(&self, doc_id: &str) -> Result<Option<DocumentState>> {
        let row = DocumentStateEntity::find_by_id(doc_id.to_string())
            .one(self.pool.conn())
            .await?;

        let Some(row) = row else { return Ok(None) };

        let chunk_hashes: Vec<String> = serde_json::from_value(row.chunk_hashes)?;
        let chunk_ids: Vec<String> = serde_json::from_value(row.chunk_ids)?;

        Ok(Some(DocumentState {
            doc_id: row.doc_id,
            file_hash: row.file_hash,
            chunk_hashes,
            chunk_ids,
            last_processed_at: row.last_processed_at.to_utc(),
            metadata_snapshot: row.metadata_snapshot,
        }))
    }

    async fn save_state(&self, state: &DocumentState) -> Result<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            INSERT INTO document_states (
                doc_id, file_hash, chunk_hashes, chunk_ids,
                last_processed_at, metadata_snapshot
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (doc_id) DO UPDATE SET
                file_hash = EXCLUDED.file_hash,
                chunk_hashes = EXCLUDED.chunk_hashes,
                chunk_ids = EXCLUDED.chunk_ids,
                last_processed_at = EXCLUDED.last_processed_at,
                metadata_snapshot = EXCLUDED.metadata_snapshot
            "#,
            vec![
                state.doc_id.clone().into(),
                state.file_hash.clone().into(),
                serde_json::to_value(&state.chunk_hashes)?.into(),
                serde_json::to_value(&state.chunk_ids)?.into(),
                state.last_processed_at.into(),
                state.metadata_snapshot.clone().into(),
            ],
        );

        self.pool.conn().execute(stmt).await?;
        Ok(())
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        DocumentStateEntity::delete_many()
            .filter(DocumentStateColumn::DocId.eq(doc_id.to_string()))
            .exec(self.pool.conn())
            .await?;

        DocumentEntity::delete_by_id(doc_id.to_string())
            .exec(self.pool.conn())
            .await?;
        Ok(())
    }
}
