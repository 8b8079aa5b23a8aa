//! Document entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::state::{DocumentRecord, DocumentStatus, FileType};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "documents")]
pub struct Model {
    /// Opaque stable document id
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub id: String,

    #[sea_orm(column_type = "Text")]
    pub source_path: String,

    #[sea_orm(column_type = "Text")]
    pub file_type: String,

    pub metadata: Json,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    pub size_bytes: i64,

    pub node_count: i32,

    pub last_processed_at: Option<DateTimeWithTimeZone>,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Convert the row into the caller-visible record.
    pub fn into_record(self) -> DocumentRecord {
        DocumentRecord {
            doc_id: self.id,
            source_path: self.source_path,
            file_type: parse_file_type(&self.file_type),
            metadata: self.metadata,
            status: DocumentStatus::parse(&self.status),
            size_bytes: self.size_bytes.max(0) as u64,
            node_count: self.node_count.max(0) as usize,
            last_processed_at: self.last_processed_at.map(|t| t.to_utc()),
            error: self.error_message,
        }
    }
}

fn parse_file_type(s: &str) -> FileType {
    match s {
        "pdf" => FileType::Pdf,
        "docx" => FileType::Docx,
        "md" => FileType::Md,
        "txt" => FileType::Txt,
        "code" => FileType::Code,
        "html" => FileType::Html,
        "table" => FileType::Table,
        _ => FileType::Other,
    }
}
