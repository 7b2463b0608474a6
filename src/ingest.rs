//! Embedding ingestion pipeline.
//!
//! Turns the chunks of one document into [`EmbeddedRecord`]s: one embedding
//! request per chunk, at most `fan_out` in flight. Records come back in
//! completion order; match them to inputs with [`EmbeddedRecord::key`].
//!
//! A batch either succeeds for every chunk or fails as a whole. The first
//! failing chunk (request error, or a vector of the wrong length) aborts the
//! batch and drops whatever requests are still in flight, so a caller never
//! holds a partial set of records to insert.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;

use tenant_vault_core::embedding::Embedder;
use tenant_vault_core::models::{ContentChunk, EmbeddedRecord, ValidityWindow};

use crate::error::{VaultError, VaultResult};

/// Embed every chunk of one document.
pub async fn embed_document(
    embedder: &dyn Embedder,
    chunks: Vec<ContentChunk>,
    window: ValidityWindow,
    fan_out: usize,
) -> VaultResult<Vec<EmbeddedRecord>> {
    check_batch(&chunks)?;

    let total = chunks.len();
    let dims = embedder.dims();

    let records: Vec<EmbeddedRecord> = stream::iter(chunks)
        .map(|chunk| embed_chunk(embedder, chunk, window, dims))
        .buffer_unordered(fan_out.max(1))
        .try_collect()
        .await
        .inspect_err(|e| {
            tracing::warn!(error = %e, chunks = total, "embedding batch aborted");
        })?;

    tracing::debug!(records = records.len(), model = embedder.model_name(), "embedding batch complete");
    Ok(records)
}

async fn embed_chunk(
    embedder: &dyn Embedder,
    chunk: ContentChunk,
    window: ValidityWindow,
    dims: usize,
) -> VaultResult<EmbeddedRecord> {
    let vector = embedder
        .embed(&chunk.content)
        .await
        .map_err(|e| VaultError::EmbeddingRequestFailed {
            chunk: chunk.key(),
            reason: format!("{:#}", e),
        })?;

    if vector.len() != dims {
        return Err(VaultError::EmbeddingRequestFailed {
            chunk: chunk.key(),
            reason: format!("expected {} dimensions, got {}", dims, vector.len()),
        });
    }

    Ok(EmbeddedRecord {
        chunk,
        vector,
        window,
    })
}

/// Chunk keys must be unique within a document, otherwise results cannot be
/// matched back to their inputs.
fn check_batch(chunks: &[ContentChunk]) -> VaultResult<()> {
    let mut seen = HashSet::with_capacity(chunks.len());
    for chunk in chunks {
        if !seen.insert(chunk.key()) {
            return Err(VaultError::InvalidInput(format!(
                "duplicate chunk {} in document {}",
                chunk.key(),
                chunk.doc_id
            )));
        }
    }
    Ok(())
}
