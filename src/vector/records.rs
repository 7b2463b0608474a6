//! Conversion between [`EmbeddedRecord`]s and Arrow record batches.

use arrow::array::{
    Array, ArrayRef, FixedSizeListBuilder, Float32Array, Float32Builder, Float64Array, Int64Array,
    StringArray,
};
use arrow::record_batch::RecordBatch;
use serde::Serialize;
use std::sync::Arc;

use tenant_vault_core::models::{
    from_epoch, to_epoch, ChunkPosition, EmbeddedRecord, ValidityWindow,
};

use super::schema::{self, Layout, VectorSchema};
use crate::error::{VaultError, VaultResult};

/// One row returned by a similarity search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub doc_id: String,
    pub user_id: String,
    pub file_type: String,
    pub content: String,
    #[serde(flatten)]
    pub position: ChunkPosition,
    #[serde(flatten)]
    pub window: ValidityWindow,
    /// Cosine distance to the query; smaller is closer.
    pub distance: f32,
}

/// Build a batch for `table` from records that must all fit `schema`.
pub fn records_to_batch(
    table: &str,
    schema: &VectorSchema,
    records: &[EmbeddedRecord],
) -> VaultResult<RecordBatch> {
    for record in records {
        if record.vector.len() != schema.dims {
            return Err(mismatch(
                table,
                format!(
                    "record {} has {} dimensions, table has {}",
                    record.key(),
                    record.vector.len(),
                    schema.dims
                ),
            ));
        }
        if Layout::of(&record.chunk.position) != schema.layout {
            return Err(mismatch(
                table,
                format!(
                    "record {} is {:?}, table is {:?}",
                    record.key(),
                    Layout::of(&record.chunk.position),
                    schema.layout
                ),
            ));
        }
    }

    let mut vectors = FixedSizeListBuilder::new(
        Float32Builder::with_capacity(schema.dims * records.len()),
        schema.dims as i32,
    );
    for record in records {
        vectors.values().append_slice(&record.vector);
        vectors.append(true);
    }

    let strings = |f: fn(&EmbeddedRecord) -> &str| -> ArrayRef {
        Arc::new(StringArray::from_iter_values(records.iter().map(f)))
    };
    let ints = |f: fn(&EmbeddedRecord) -> i64| -> ArrayRef {
        Arc::new(Int64Array::from_iter_values(records.iter().map(f)))
    };

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(vectors.finish()),
        strings(|r| r.chunk.content.as_str()),
        strings(|r| r.chunk.doc_id.as_str()),
        strings(|r| r.chunk.user_id.as_str()),
        strings(|r| r.chunk.file_type.as_str()),
    ];

    match schema.layout {
        Layout::Paged => columns.push(ints(|r| match r.chunk.position {
            ChunkPosition::Page { page_id } => page_id,
            ChunkPosition::Span { chunk_id, .. } => chunk_id,
        })),
        Layout::Timed => {
            let spans: Vec<(i64, f64, f64)> = records
                .iter()
                .map(|r| match r.chunk.position {
                    ChunkPosition::Span {
                        chunk_id,
                        start,
                        end,
                    } => (chunk_id, start, end),
                    ChunkPosition::Page { page_id } => (page_id, 0.0, 0.0),
                })
                .collect();
            columns.push(Arc::new(Int64Array::from_iter_values(
                spans.iter().map(|s| s.0),
            )));
            columns.push(Arc::new(Float64Array::from_iter_values(
                spans.iter().map(|s| s.1),
            )));
            columns.push(Arc::new(Float64Array::from_iter_values(
                spans.iter().map(|s| s.2),
            )));
        }
    }

    columns.push(ints(|r| to_epoch(r.window.display_date)));
    columns.push(ints(|r| to_epoch(r.window.expire_date)));

    Ok(RecordBatch::try_new(schema.arrow(), columns)?)
}

/// Read search results out of a batch returned by the index.
pub fn batch_to_hits(batch: &RecordBatch) -> VaultResult<Vec<SearchHit>> {
    let content = string_column(batch, schema::CONTENT)?;
    let doc_id = string_column(batch, schema::DOC_ID)?;
    let user_id = string_column(batch, schema::USER_ID)?;
    let file_type = string_column(batch, schema::FILE_TYPE)?;
    let display = typed_column::<Int64Array>(batch, schema::DISPLAY_DATE)?;
    let expire = typed_column::<Int64Array>(batch, schema::EXPIRE_DATE)?;
    let distance = batch
        .column_by_name("_distance")
        .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

    let positions = if batch.column_by_name(schema::PAGE_ID).is_some() {
        PositionColumns::Paged(typed_column::<Int64Array>(batch, schema::PAGE_ID)?)
    } else {
        PositionColumns::Timed(
            typed_column::<Int64Array>(batch, schema::CHUNK_ID)?,
            typed_column::<Float64Array>(batch, schema::START)?,
            typed_column::<Float64Array>(batch, schema::END)?,
        )
    };

    let mut hits = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let position = match positions {
            PositionColumns::Paged(page_id) => ChunkPosition::Page {
                page_id: page_id.value(i),
            },
            PositionColumns::Timed(chunk_id, start, end) => ChunkPosition::Span {
                chunk_id: chunk_id.value(i),
                start: start.value(i),
                end: end.value(i),
            },
        };
        hits.push(SearchHit {
            doc_id: doc_id.value(i).to_string(),
            user_id: user_id.value(i).to_string(),
            file_type: file_type.value(i).to_string(),
            content: content.value(i).to_string(),
            position,
            window: ValidityWindow {
                display_date: from_epoch(display.value(i)),
                expire_date: from_epoch(expire.value(i)),
            },
            distance: distance
                .filter(|d| !d.is_null(i))
                .map(|d| d.value(i))
                .unwrap_or(f32::NAN),
        });
    }
    Ok(hits)
}

#[derive(Clone, Copy)]
enum PositionColumns<'a> {
    Paged(&'a Int64Array),
    Timed(&'a Int64Array, &'a Float64Array, &'a Float64Array),
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> VaultResult<&'a StringArray> {
    typed_column::<StringArray>(batch, name)
}

fn typed_column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> VaultResult<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| mismatch("<result>", format!("missing or mistyped column '{}'", name)))
}

fn mismatch(table: &str, detail: String) -> VaultError {
    VaultError::SchemaMismatch {
        table: table.to_string(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenant_vault_core::models::ContentChunk;

    fn record(position: ChunkPosition, vector: Vec<f32>) -> EmbeddedRecord {
        EmbeddedRecord {
            chunk: ContentChunk {
                doc_id: "d1".to_string(),
                user_id: "u1".to_string(),
                file_type: "mp4".to_string(),
                position,
                content: "hello".to_string(),
            },
            vector,
            window: ValidityWindow {
                display_date: from_epoch(100),
                expire_date: from_epoch(200),
            },
        }
    }

    #[test]
    fn test_timed_batch_reads_back() {
        let schema = VectorSchema::new(Layout::Timed, 2);
        let span = ChunkPosition::Span {
            chunk_id: 7,
            start: 1.5,
            end: 9.0,
        };
        let batch = records_to_batch("t", &schema, &[record(span, vec![0.1, 0.2])]).unwrap();
        assert_eq!(batch.num_rows(), 1);

        let hits = batch_to_hits(&batch).unwrap();
        assert_eq!(hits[0].position, span);
        assert_eq!(hits[0].window.display_date, from_epoch(100));
        assert_eq!(hits[0].doc_id, "d1");
        assert!(hits[0].distance.is_nan());
    }

    #[test]
    fn test_wrong_dimensions_rejected() {
        let schema = VectorSchema::new(Layout::Paged, 3);
        let err = records_to_batch(
            "t",
            &schema,
            &[record(ChunkPosition::Page { page_id: 0 }, vec![1.0])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), "schema_mismatch");
    }

    #[test]
    fn test_wrong_layout_rejected() {
        let schema = VectorSchema::new(Layout::Paged, 1);
        let span = ChunkPosition::Span {
            chunk_id: 0,
            start: 0.0,
            end: 1.0,
        };
        let err = records_to_batch("t", &schema, &[record(span, vec![1.0])]).unwrap_err();
        assert!(err.to_string().contains("Timed"));
    }

    #[test]
    fn test_empty_batch_has_schema() {
        let schema = VectorSchema::new(Layout::Paged, 4);
        let batch = records_to_batch("t", &schema, &[]).unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.schema(), schema.arrow());
    }
}
