//! The fixed column layout of vector index tables.

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tenant_vault_core::models::ChunkPosition;

pub const VECTOR: &str = "vector";
pub const CONTENT: &str = "content";
pub const DOC_ID: &str = "doc_id";
pub const USER_ID: &str = "user_id";
pub const FILE_TYPE: &str = "file_type";
pub const PAGE_ID: &str = "page_id";
pub const CHUNK_ID: &str = "chunk_id";
pub const START: &str = "start";
pub const END: &str = "end";
pub const DISPLAY_DATE: &str = "display_date";
pub const EXPIRE_DATE: &str = "expire_date";

/// How chunks of a table are positioned inside their documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// `page_id` column; PDFs and text.
    Paged,
    /// `chunk_id`, `start`, `end` columns; transcripts of time-based media.
    Timed,
}

impl Layout {
    pub fn of(position: &ChunkPosition) -> Self {
        match position {
            ChunkPosition::Page { .. } => Layout::Paged,
            ChunkPosition::Span { .. } => Layout::Timed,
        }
    }
}

/// Schema of one vector table: layout plus embedding width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorSchema {
    pub layout: Layout,
    pub dims: usize,
}

impl VectorSchema {
    pub fn new(layout: Layout, dims: usize) -> Self {
        Self { layout, dims }
    }

    pub fn arrow(&self) -> SchemaRef {
        let mut fields = vec![
            Field::new(
                VECTOR,
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dims as i32,
                ),
                false,
            ),
            Field::new(CONTENT, DataType::Utf8, false),
            Field::new(DOC_ID, DataType::Utf8, false),
            Field::new(USER_ID, DataType::Utf8, false),
            Field::new(FILE_TYPE, DataType::Utf8, false),
        ];
        match self.layout {
            Layout::Paged => fields.push(Field::new(PAGE_ID, DataType::Int64, false)),
            Layout::Timed => {
                fields.push(Field::new(CHUNK_ID, DataType::Int64, false));
                fields.push(Field::new(START, DataType::Float64, false));
                fields.push(Field::new(END, DataType::Float64, false));
            }
        }
        fields.push(Field::new(DISPLAY_DATE, DataType::Int64, false));
        fields.push(Field::new(EXPIRE_DATE, DataType::Int64, false));
        Arc::new(Schema::new(fields))
    }

    /// Recover the schema of an existing table, if it is one of ours.
    pub fn from_arrow(schema: &Schema) -> Option<Self> {
        let dims = match schema.field_with_name(VECTOR).ok()?.data_type() {
            DataType::FixedSizeList(_, n) if *n > 0 => *n as usize,
            _ => return None,
        };
        let layout = if schema.field_with_name(PAGE_ID).is_ok() {
            Layout::Paged
        } else {
            Layout::Timed
        };
        let candidate = Self::new(layout, dims);
        if describe(schema) == describe(&candidate.arrow()) {
            Some(candidate)
        } else {
            None
        }
    }

    /// Human-readable difference between `self` and an existing table schema,
    /// or `None` when they are the same.
    pub fn diff(&self, existing: &Schema) -> Option<String> {
        let wanted = describe(&self.arrow());
        let found = describe(existing);
        if wanted == found {
            None
        } else {
            Some(format!(
                "expected [{}], found [{}]",
                wanted.join(", "),
                found.join(", ")
            ))
        }
    }
}

/// Field names, types and nullability; field metadata is ignored.
fn describe(schema: &Schema) -> Vec<String> {
    schema
        .fields()
        .iter()
        .map(|f| {
            let ty = match f.data_type() {
                DataType::FixedSizeList(inner, n) => {
                    format!("FixedSizeList<{}, {}>", inner.data_type(), n)
                }
                other => other.to_string(),
            };
            format!(
                "{}: {}{}",
                f.name(),
                ty,
                if f.is_nullable() { "?" } else { "" }
            )
        })
        .collect()
}

/// Table names become directory names under the vector root.
pub fn validate_table_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > 128 {
        return Err(format!("invalid table name '{}'", name));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(format!(
            "invalid table name '{}': use ASCII letters, digits, '_' or '-'",
            name
        ));
    }
    Ok(())
}
