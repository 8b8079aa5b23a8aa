//! SeaORM entity models

mod document;
mod document_state;

pub use document::{
    ActiveModel as DocumentActiveModel, Column as DocumentColumn, Entity as DocumentEntity,
    Model as DocumentRow,
};

pub use document_state::{
    ActiveModel as DocumentStateActiveModel, Column as DocumentStateColumn,
    Entity as DocumentStateEntity, Model as DocumentStateRow,
};
