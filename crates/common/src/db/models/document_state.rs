//! DocumentState blob entity
//!
//! One row per document holding the content hashes of the last successful
//! ingest. Chunk hashes and ids are JSON arrays; the incremental diff is
//! computed in memory.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "document_states")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub doc_id: String,

    #[sea_orm(column_type = "Text")]
    pub file_hash: String,

    pub chunk_hashes: Json,

    pub chunk_ids: Json,

    pub last_processed_at: DateTimeWithTimeZone,

    pub metadata_snapshot: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
