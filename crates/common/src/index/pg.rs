//! Postgres + pgvector index adapter.
//!
//! One table carries the chunk fields plus a pgvector `embedding` column
//! and a generated `tsvector` for lexical ranking. Dense search orders by
//! the cosine distance operator; lexical search ranks with `ts_rank_cd`.

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DbBackend, Statement, Value as DbValue};
use serde_json::Value;

use super::{Filter, FilterClause, IndexManagement, Node, ScoredNode, VectorIndex};
use crate::db::DbPool;
use crate::errors::{AppError, Result};

pub struct PgVectorIndex {
    pool: DbPool,
    table: String,
}

impl PgVectorIndex {
    pub fn new(pool: DbPool, table: String) -> Self {
        Self { pool, table }
    }

    /// pgvector literal format: `[0.1,0.2,...]`
    fn vector_literal(embedding: &[f32]) -> String {
        let mut s = String::with_capacity(embedding.len() * 8 + 2);
        s.push('[');
        for (i, v) in embedding.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            s.push_str(&v.to_string());
        }
        s.push(']');
        s
    }

    /// Render filter clauses as SQL predicates over the metadata JSONB
    /// column, appending bind values. `doc_id` targets the real column.
    fn filter_sql(filter: Option<&Filter>, values: &mut Vec<DbValue>) -> Result<String> {
        let Some(filter) = filter else {
            return Ok(String::new());
        };

        let mut sql = String::new();
        for clause in &filter.clauses {
            match clause {
                FilterClause::Eq { field, value } => {
                    values.push(json_as_text(value).into());
                    let param = values.len();
                    if field == "doc_id" {
                        sql.push_str(&format!(" AND doc_id = ${param}"));
                    } else {
                        sql.push_str(&format!(" AND metadata->>'{}' = ${param}", sanitize(field)?));
                    }
                }
                FilterClause::In { field, values: list } => {
                    if list.is_empty() {
                        sql.push_str(" AND FALSE");
                        continue;
                    }
                    let mut params = Vec::with_capacity(list.len());
                    for v in list {
                        values.push(json_as_text(v).into());
                        params.push(format!("${}", values.len()));
                    }
                    let set = params.join(", ");
                    if field == "doc_id" {
                        sql.push_str(&format!(" AND doc_id IN ({set})"));
                    } else {
                        sql.push_str(&format!(
                            " AND metadata->>'{}' IN ({set})",
                            sanitize(field)?
                        ));
                    }
                }
            }
        }
        Ok(sql)
    }

    fn row_to_hit(row: &sea_orm::QueryResult) -> Option<ScoredNode> {
        Some(ScoredNode {
            chunk_id: row.try_get_by_index::<String>(0).ok()?,
            doc_id: row.try_get_by_index::<String>(1).ok()?,
            ordinal: row.try_get_by_index::<i32>(2).ok()?.max(0) as usize,
            text: row.try_get_by_index::<String>(3).ok()?,
            metadata: row.try_get_by_index::<Value>(4).ok()?,
            score: row.try_get_by_index::<f64>(5).ok()? as f32,
            spans: Vec::new(),
        })
    }
}

/// Metadata field names come from configuration and filters; restrict them
/// to identifier characters since they are interpolated into SQL.
fn sanitize(field: &str) -> Result<&str> {
    if !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Ok(field)
    } else {
        Err(AppError::UnsupportedFilter {
            message: format!("invalid filter field name: {field}"),
        })
    }
}

/// Filters compare against `metadata->>field`, which yields text.
fn json_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn ensure_collection(
        &self,
        name: &str,
        dim: usize,
        management: IndexManagement,
    ) -> Result<()> {
        if management == IndexManagement::NoValidation {
            return Ok(());
        }

        let table = sanitize(name)?;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                text TEXT NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{{}}',
                content_hash TEXT NOT NULL,
                embedding vector({dim}),
                text_search tsvector GENERATED ALWAYS AS (to_tsvector('english', text)) STORED
            );
            CREATE INDEX IF NOT EXISTS {table}_doc_id_idx ON {table} (doc_id);
            CREATE INDEX IF NOT EXISTS {table}_text_search_idx ON {table} USING GIN (text_search);
            "#
        );

        self.pool
            .conn()
            .execute_unprepared(&ddl)
            .await
            .map_err(|e| AppError::StoreFatal {
                message: format!("ensure_collection failed: {e}"),
            })?;
        Ok(())
    }

    async fn upsert(&self, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            let stmt = Statement::from_sql_and_values(
                DbBackend::Postgres,
                &format!(
                    r#"
                    INSERT INTO {} (id, doc_id, ordinal, text, metadata, content_hash, embedding)
                    VALUES ($1, $2, $3, $4, $5, $6, $7::vector)
                    ON CONFLICT (id) DO UPDATE SET
                        doc_id = EXCLUDED.doc_id,
                        ordinal = EXCLUDED.ordinal,
                        text = EXCLUDED.text,
                        metadata = EXCLUDED.metadata,
                        content_hash = EXCLUDED.content_hash,
                        embedding = EXCLUDED.embedding
                    "#,
                    self.table
                ),
                vec![
                    node.chunk_id.clone().into(),
                    node.doc_id.clone().into(),
                    (node.ordinal as i32).into(),
                    node.text.clone().into(),
                    node.metadata.clone().into(),
                    node.content_hash.clone().into(),
                    Self::vector_literal(&node.embedding).into(),
                ],
            );

            self.pool.conn().execute(stmt).await?;
        }
        Ok(())
    }

    async fn delete_by_doc(&self, doc_id: &str) -> Result<usize> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            &format!("DELETE FROM {} WHERE doc_id = $1", self.table),
            vec![doc_id.into()],
        );
        let result = self.pool.conn().execute(stmt).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn delete_by_ids(&self, chunk_ids: &[String]) -> Result<usize> {
        if chunk_ids.is_empty() {
            return Ok(0);
        }
        let params: Vec<String> = (1..=chunk_ids.len()).map(|i| format!("${i}")).collect();
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            &format!(
                "DELETE FROM {} WHERE id IN ({})",
                self.table,
                params.join(", ")
            ),
            chunk_ids.iter().map(|id| id.clone().into()).collect::<Vec<DbValue>>(),
        );
        let result = self.pool.conn().execute(stmt).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredNode>> {
        let mut values: Vec<DbValue> = vec![
            Self::vector_literal(query).into(),
            (k as i64).into(),
        ];
        let filter_sql = Self::filter_sql(filter, &mut values)?;

        let sql = format!(
            r#"
            SELECT
                id, doc_id, ordinal, text, metadata,
                1 - (embedding <=> $1::vector) as score
            FROM {}
            WHERE embedding IS NOT NULL
            {filter_sql}
            ORDER BY embedding <=> $1::vector
            LIMIT $2
            "#,
            self.table
        );

        let rows = self
            .pool
            .conn()
            .query_all(Statement::from_sql_and_values(
                DbBackend::Postgres,
                &sql,
                values,
            ))
            .await?;

        Ok(rows.iter().filter_map(Self::row_to_hit).collect())
    }

    async fn lexical_search(
        &self,
        terms: &[String],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredNode>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut values: Vec<DbValue> = vec![terms.join(" ").into(), (k as i64).into()];
        let filter_sql = Self::filter_sql(filter, &mut values)?;

        let sql = format!(
            r#"
            SELECT
                id, doc_id, ordinal, text, metadata,
                ts_rank_cd(text_search, plainto_tsquery('english', $1), 32) as score
            FROM {}
            WHERE text_search @@ plainto_tsquery('english', $1)
            {filter_sql}
            ORDER BY score DESC
            LIMIT $2
            "#,
            self.table
        );

        let rows = self
            .pool
            .conn()
            .query_all(Statement::from_sql_and_values(
                DbBackend::Postgres,
                &sql,
                values,
            ))
            .await?;

        Ok(rows.iter().filter_map(Self::row_to_hit).collect())
    }

    async fn count_by_doc(&self, doc_id: &str) -> Result<usize> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            &format!("SELECT COUNT(*)::bigint AS n FROM {} WHERE doc_id = $1", self.table),
            vec![doc_id.into()],
        );
        let row = self.pool.conn().query_one(stmt).await?;
        let n: i64 = row
            .and_then(|r| r.try_get_by_index::<i64>(0).ok())
            .unwrap_or(0);
        Ok(n.max(0) as usize)
    }
}
