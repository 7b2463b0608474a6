//! Document indexing: the handlers that drive registry, migrations,
//! embedding and the vector router together.
//!
//! The relational store is the record of truth. Vector rows are a secondary
//! index over it: a vector write that fails after the relational commit is
//! returned to the caller and logged, and [`reindex`] rebuilds a table from
//! the relational rows.
//!
//! ```text
//! index_document:  embed (all or nothing) → ensure_table → [gate] SQL upsert
//!                  → delete_where(doc_id) → add
//! delete_document: [gate] SQL delete (chunks cascade) → delete_where(doc_id)
//! reindex:         [gate] load → embed → delete_where(all) → add
//! search:          provision/migrate → embed query → filtered search
//! ```
//!
//! `[gate]` is the table's write gate in the vector router, held to the end of
//! the operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::{Connection, Row};
use uuid::Uuid;

use tenant_vault_core::models::{
    from_epoch, to_epoch, ChunkPosition, ContentChunk, EmbeddedRecord, Scope, ValidityWindow,
};

use crate::error::{VaultError, VaultResult};
use crate::ingest::embed_document;
use crate::vault::Vault;
use crate::vector::{Layout, Predicate, SearchHit, VectorSchema};

/// One chunk as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInput {
    #[serde(flatten)]
    pub position: ChunkPosition,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRequest {
    /// Generated when absent.
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub file_type: String,
    /// Vector table the chunks go to, e.g. `KnowledgeObject_table`.
    pub table: String,
    #[serde(default)]
    pub display_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expire_date: Option<DateTime<Utc>>,
    pub chunks: Vec<ChunkInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub doc_id: String,
    pub table: String,
    pub chunks: usize,
    /// Vector rows of a previous version that were replaced.
    pub replaced: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub doc_id: String,
    pub chunks: usize,
    pub vectors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReindexReport {
    pub table: String,
    pub documents: usize,
    pub chunks: usize,
    /// Rows present before the rebuild, including orphans.
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableStats {
    pub table: String,
    /// `None` when documents are assigned to a table that was never built.
    pub schema: Option<VectorSchema>,
    pub documents: usize,
    pub chunks: usize,
    pub vectors: usize,
    /// Vector rows whose document is visible right now.
    pub visible: usize,
    /// Whether every stored chunk has exactly one vector row; `reindex` when not.
    pub in_sync: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    pub table: String,
    pub query: String,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub filter: Option<Predicate>,
    /// Only return chunks whose document is visible at this instant.
    #[serde(default)]
    pub valid_at: Option<DateTime<Utc>>,
}

/// Embed and store one document, replacing any previous version.
pub async fn index_document(
    vault: &Vault,
    scope: &Scope,
    request: IndexRequest,
) -> VaultResult<IndexReport> {
    let doc_id = match request.doc_id.as_deref() {
        Some("") => return Err(VaultError::InvalidInput("doc_id must not be empty".into())),
        Some(id) => id.to_string(),
        None => Uuid::new_v4().to_string(),
    };
    let layout = layout_of(&request.chunks)?;
    let window = ValidityWindow {
        display_date: request.display_date.unwrap_or_else(Utc::now),
        expire_date: request.expire_date.unwrap_or(DateTime::<Utc>::MAX_UTC),
    };
    if window.expire_date < window.display_date {
        return Err(VaultError::InvalidInput(
            "expire_date is before display_date".into(),
        ));
    }

    let embedder = vault.embedder()?;
    let (mut conn, _) = vault.registry().open(scope).await?;

    let chunks: Vec<ContentChunk> = request
        .chunks
        .iter()
        .map(|c| ContentChunk {
            doc_id: doc_id.clone(),
            user_id: scope.owner().to_string(),
            file_type: request.file_type.clone(),
            position: c.position,
            content: c.content.clone(),
        })
        .collect();

    // Nothing is written anywhere unless every chunk embedded.
    let records = embed_document(embedder, chunks, window, vault.fan_out()).await?;

    let schema = VectorSchema::new(layout, embedder.dims());
    vault
        .vectors()
        .ensure_table(scope, &request.table, &schema)
        .await?;

    // The document's current table is read again under the gates; if another
    // writer moved it in between, take the gates for the new pair instead.
    let (previous_table, _gates) = loop {
        let previous = vector_table_of(conn.ready().await?, &doc_id).await?;
        let mut tables = vec![request.table.as_str()];
        tables.extend(previous.as_deref());
        let gates = vault.vectors().lock_tables(scope, &tables).await;
        if vector_table_of(conn.ready().await?, &doc_id).await? == previous {
            break (previous, gates);
        }
    };
    upsert_document(conn.ready().await?, &doc_id, &request, window).await?;
    conn.close().await?;

    let mut replaced = 0;
    if let Some(old) = previous_table.filter(|t| *t != request.table) {
        replaced += lagging(scope, &doc_id, vault.vectors().delete_where(scope, &old, &Predicate::doc_id(&doc_id)).await)?;
    }
    replaced += lagging(
        scope,
        &doc_id,
        vault
            .vectors()
            .delete_where(scope, &request.table, &Predicate::doc_id(&doc_id))
            .await,
    )?;
    lagging(
        scope,
        &doc_id,
        vault.vectors().add(scope, &request.table, &records).await,
    )?;

    tracing::info!(scope = %scope, doc_id = %doc_id, table = %request.table, chunks = records.len(), replaced, "document indexed");

    Ok(IndexReport {
        doc_id,
        table: request.table,
        chunks: records.len(),
        replaced,
    })
}

/// Remove a document and its vector rows.
pub async fn delete_document(vault: &Vault, scope: &Scope, doc_id: &str) -> VaultResult<DeleteReport> {
    let (mut conn, _) = vault.registry().open(scope).await?;

    let (table, _gate) = loop {
        let table = vector_table_of(conn.ready().await?, doc_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("document '{}'", doc_id)))?;
        let gate = vault.vectors().lock_tables(scope, &[table.as_str()]).await;
        if vector_table_of(conn.ready().await?, doc_id).await?.as_deref() == Some(table.as_str()) {
            break (table, gate);
        }
    };
    let chunks = {
        let c = conn.ready().await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_one(&mut *c)
            .await?;
        sqlx::query("DELETE FROM documents WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *c)
            .await?;
        chunks as usize
    };
    conn.close().await?;

    let vectors = lagging(
        scope,
        doc_id,
        vault
            .vectors()
            .delete_where(scope, &table, &Predicate::doc_id(doc_id))
            .await,
    )?;

    tracing::info!(scope = %scope, doc_id, table = %table, chunks, vectors, "document deleted");
    Ok(DeleteReport {
        doc_id: doc_id.to_string(),
        chunks,
        vectors,
    })
}

/// Rebuild `table` from the relational store: every document assigned to it
/// is re-embedded, then the table's rows are replaced wholesale.
pub async fn reindex(vault: &Vault, scope: &Scope, table: &str) -> VaultResult<ReindexReport> {
    let embedder = vault.embedder()?;
    // Held until the rows are replaced, so no index or delete on this table
    // lands between the snapshot and the rebuild.
    let _gate = vault.vectors().lock_tables(scope, &[table]).await;
    let (mut conn, _) = vault.registry().open(scope).await?;
    let documents = load_documents(conn.ready().await?, scope, table).await?;
    conn.close().await?;

    let mut layout = None;
    let mut records: Vec<EmbeddedRecord> = Vec::new();
    for doc in &documents {
        if doc.chunks.is_empty() {
            continue;
        }
        let doc_layout = Layout::of(&doc.chunks[0].position);
        if *layout.get_or_insert(doc_layout) != doc_layout {
            return Err(VaultError::InvalidInput(format!(
                "table '{}' holds both paged and timed documents",
                table
            )));
        }
        records.extend(embed_document(embedder, doc.chunks.clone(), doc.window, vault.fan_out()).await?);
    }

    let removed = match layout {
        Some(layout) => {
            vault
                .vectors()
                .ensure_table(scope, table, &VectorSchema::new(layout, embedder.dims()))
                .await?;
            let removed = vault
                .vectors()
                .delete_where(scope, table, &Predicate::And(Vec::new()))
                .await?;
            vault.vectors().add(scope, table, &records).await?;
            removed
        }
        None => {
            vault
                .vectors()
                .delete_where(scope, table, &Predicate::And(Vec::new()))
                .await?
        }
    };

    tracing::info!(scope = %scope, table, documents = documents.len(), chunks = records.len(), removed, "table reindexed");
    Ok(ReindexReport {
        table: table.to_string(),
        documents: documents.len(),
        chunks: records.len(),
        removed,
    })
}

/// Embed the query and return the closest chunks.
pub async fn search(vault: &Vault, scope: &Scope, request: &SearchRequest) -> VaultResult<Vec<SearchHit>> {
    if request.query.trim().is_empty() {
        return Err(VaultError::InvalidInput("query must not be empty".into()));
    }
    let k = vault.result_count(request.k)?;
    let embedder = vault.embedder()?;

    // Provision and migrate even for read-only requests.
    let (conn, _) = vault.registry().open(scope).await?;
    conn.close().await?;

    let query = embedder
        .embed(&request.query)
        .await
        .map_err(|e| VaultError::EmbeddingRequestFailed {
            chunk: "query".into(),
            reason: format!("{:#}", e),
        })?;

    let filter = match (request.filter.clone(), request.valid_at) {
        (Some(f), Some(at)) => Some(f.and(Predicate::valid_at(at))),
        (Some(f), None) => Some(f),
        (None, Some(at)) => Some(Predicate::valid_at(at)),
        (None, None) => None,
    };

    vault
        .vectors()
        .search(scope, &request.table, &query, k, filter.as_ref())
        .await
}

/// Relational and vector row counts of one table.
pub async fn table_stats(vault: &Vault, scope: &Scope, table: &str) -> VaultResult<TableStats> {
    let (mut conn, _) = vault.registry().open(scope).await?;
    let (documents, chunks) = {
        let c = conn.ready().await?;
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE vector_table = ?")
            .bind(table)
            .fetch_one(&mut *c)
            .await?;
        let chunks: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM document_chunks
             WHERE doc_id IN (SELECT doc_id FROM documents WHERE vector_table = ?)",
        )
        .bind(table)
        .fetch_one(&mut *c)
        .await?;
        (documents as usize, chunks as usize)
    };
    conn.close().await?;

    let schema = vault.vectors().table_schema(scope, table).await?;
    if schema.is_none() && documents == 0 {
        return Err(VaultError::NotFound(format!("vector table '{}'", table)));
    }
    let vectors = vault.vectors().count(scope, table, None).await?;
    let visible = vault
        .vectors()
        .count(scope, table, Some(&Predicate::valid_at(Utc::now())))
        .await?;

    Ok(TableStats {
        table: table.to_string(),
        schema,
        documents,
        chunks,
        vectors,
        visible,
        in_sync: vectors == chunks,
    })
}

fn layout_of(chunks: &[ChunkInput]) -> VaultResult<Layout> {
    let first = chunks
        .first()
        .ok_or_else(|| VaultError::InvalidInput("document has no chunks".into()))?;
    let layout = Layout::of(&first.position);
    if chunks.iter().any(|c| Layout::of(&c.position) != layout) {
        return Err(VaultError::InvalidInput(
            "a document's chunks must all be pages or all be time spans".into(),
        ));
    }
    Ok(layout)
}

/// Pass vector results through, logging when the index fell behind the
/// relational store.
fn lagging<T>(scope: &Scope, doc_id: &str, result: VaultResult<T>) -> VaultResult<T> {
    result.inspect_err(|e| {
        tracing::warn!(scope = %scope, doc_id, error = %e, "vector index lags relational store; reindex the table");
    })
}

async fn vector_table_of(conn: &mut SqliteConnection, doc_id: &str) -> VaultResult<Option<String>> {
    Ok(
        sqlx::query_scalar("SELECT vector_table FROM documents WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

async fn upsert_document(
    conn: &mut SqliteConnection,
    doc_id: &str,
    request: &IndexRequest,
    window: ValidityWindow,
) -> VaultResult<()> {
    let now = Utc::now().timestamp();
    let mut tx = conn.begin().await?;

    sqlx::query(
        "INSERT INTO documents (doc_id, title, file_type, vector_table, display_date, expire_date, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(doc_id) DO UPDATE SET
           title = excluded.title,
           file_type = excluded.file_type,
           vector_table = excluded.vector_table,
           display_date = excluded.display_date,
           expire_date = excluded.expire_date,
           updated_at = excluded.updated_at",
    )
    .bind(doc_id)
    .bind(&request.title)
    .bind(&request.file_type)
    .bind(&request.table)
    .bind(to_epoch(window.display_date))
    .bind(to_epoch(window.expire_date))
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM document_chunks WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;

    for (seq, chunk) in request.chunks.iter().enumerate() {
        let (page_id, chunk_id, start, end) = match chunk.position {
            ChunkPosition::Page { page_id } => (Some(page_id), None, None, None),
            ChunkPosition::Span {
                chunk_id,
                start,
                end,
            } => (None, Some(chunk_id), Some(start), Some(end)),
        };
        sqlx::query(
            "INSERT INTO document_chunks (doc_id, seq, page_id, chunk_id, start_sec, end_sec, content)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(doc_id)
        .bind(seq as i64)
        .bind(page_id)
        .bind(chunk_id)
        .bind(start)
        .bind(end)
        .bind(&chunk.content)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

struct StoredDocument {
    window: ValidityWindow,
    chunks: Vec<ContentChunk>,
}

async fn load_documents(
    conn: &mut SqliteConnection,
    scope: &Scope,
    table: &str,
) -> VaultResult<Vec<StoredDocument>> {
    let docs = sqlx::query(
        "SELECT doc_id, file_type, display_date, expire_date FROM documents
         WHERE vector_table = ? ORDER BY doc_id",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let doc_id: String = doc.get("doc_id");
        let file_type: String = doc.get("file_type");
        let rows = sqlx::query(
            "SELECT page_id, chunk_id, start_sec, end_sec, content FROM document_chunks
             WHERE doc_id = ? ORDER BY seq",
        )
        .bind(&doc_id)
        .fetch_all(&mut *conn)
        .await?;

        let chunks = rows
            .iter()
            .map(|row| {
                let page_id: Option<i64> = row.get("page_id");
                let position = match page_id {
                    Some(page_id) => ChunkPosition::Page { page_id },
                    None => ChunkPosition::Span {
                        chunk_id: row.get::<Option<i64>, _>("chunk_id").unwrap_or_default(),
                        start: row.get::<Option<f64>, _>("start_sec").unwrap_or_default(),
                        end: row.get::<Option<f64>, _>("end_sec").unwrap_or_default(),
                    },
                };
                ContentChunk {
                    doc_id: doc_id.clone(),
                    user_id: scope.owner().to_string(),
                    file_type: file_type.clone(),
                    position,
                    content: row.get("content"),
                }
            })
            .collect();

        out.push(StoredDocument {
            window: ValidityWindow {
                display_date: from_epoch(doc.get("display_date")),
                expire_date: from_epoch(doc.get("expire_date")),
            },
            chunks,
        });
    }
    Ok(out)
}
