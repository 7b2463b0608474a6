//! Vector store router.
//!
//! Maps a [`Scope`] to its LanceDB directory (`<root>/shared/lancedb` or
//! `<root>/userdbs/<tenant>/lancedb`) and exposes the four operations the
//! request handlers need over the fixed [`VectorSchema`]:
//!
//! | Operation | Behaviour |
//! |-----------|-----------|
//! | [`ensure_table`](VectorRouter::ensure_table) | create if absent, `SchemaMismatch` if present with another schema |
//! | [`add`](VectorRouter::add) | bulk append, no dedup |
//! | [`delete_where`](VectorRouter::delete_where) | remove matching rows, return the count |
//! | [`search`](VectorRouter::search) | top-k by cosine distance, filter applied before ranking |
//!
//! Tables are never altered once created.
//!
//! Handlers that replace a document's rows (delete then add) hold the table's
//! write gate from [`lock_tables`](VectorRouter::lock_tables) across both
//! steps, so concurrent writers on one table never interleave.

pub mod predicate;
pub mod records;
pub mod schema;

use arrow::record_batch::{RecordBatch, RecordBatchIterator};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, Table};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

use tenant_vault_core::models::{EmbeddedRecord, Scope};

use crate::error::{VaultError, VaultResult};
use crate::registry::TenantRegistry;

pub use predicate::{CompareOp, Literal, Predicate};
pub use records::SearchHit;
pub use schema::{Layout, VectorSchema};

pub struct VectorRouter {
    registry: Arc<TenantRegistry>,
    connections: Mutex<HashMap<Scope, Connection>>,
    create_gate: tokio::sync::Mutex<()>,
    write_gates: Mutex<HashMap<(Scope, String), Arc<tokio::sync::Mutex<()>>>>,
}

/// Held write gates of one or more tables; released on drop.
pub struct TableGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl VectorRouter {
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        Self {
            registry,
            connections: Mutex::new(HashMap::new()),
            create_gate: tokio::sync::Mutex::new(()),
            write_gates: Mutex::new(HashMap::new()),
        }
    }

    /// Take the write gates of `tables` in `scope`.
    ///
    /// Gates are acquired in name order so two callers locking overlapping
    /// sets cannot deadlock. Duplicates are taken once.
    pub async fn lock_tables(&self, scope: &Scope, tables: &[&str]) -> TableGuard {
        let mut names: Vec<&str> = tables.to_vec();
        names.sort_unstable();
        names.dedup();

        let mut guards = Vec::with_capacity(names.len());
        for name in names {
            let gate = self
                .write_gates
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .entry((scope.clone(), name.to_string()))
                .or_default()
                .clone();
            guards.push(gate.lock_owned().await);
        }
        TableGuard { _guards: guards }
    }

    /// Directory holding the vector tables of `scope`.
    pub fn root(&self, scope: &Scope) -> PathBuf {
        self.registry.vector_root(scope)
    }

    async fn connection(&self, scope: &Scope) -> VaultResult<Connection> {
        let cached = self
            .connections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(scope)
            .cloned();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let root = self.root(scope);
        std::fs::create_dir_all(&root).map_err(|e| VaultError::storage(&root, e))?;
        let conn = lancedb::connect(&root.to_string_lossy())
            .execute()
            .await
            .map_err(|e| VaultError::storage(&root, e))?;

        Ok(self
            .connections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(scope.clone())
            .or_insert(conn)
            .clone())
    }

    /// Open `table`, or `None` if it does not exist yet.
    async fn open(&self, scope: &Scope, table: &str) -> VaultResult<Option<Table>> {
        check_table_name(table)?;
        let conn = self.connection(scope).await?;
        match conn.open_table(table).execute().await {
            Ok(t) => Ok(Some(t)),
            Err(lancedb::Error::TableNotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Make sure `table` exists in `scope` with exactly `schema`.
    pub async fn ensure_table(
        &self,
        scope: &Scope,
        table: &str,
        schema: &VectorSchema,
    ) -> VaultResult<()> {
        self.ensure(scope, table, schema).await.map(|_| ())
    }

    async fn ensure(&self, scope: &Scope, table: &str, schema: &VectorSchema) -> VaultResult<Table> {
        if let Some(existing) = self.open(scope, table).await? {
            return verify_schema(existing, table, schema).await;
        }

        // Creators in this process take turns; other processes are caught by
        // TableAlreadyExists below.
        let _gate = self.create_gate.lock().await;
        if let Some(existing) = self.open(scope, table).await? {
            return verify_schema(existing, table, schema).await;
        }

        let conn = self.connection(scope).await?;
        let arrow_schema = schema.arrow();
        let empty = RecordBatchIterator::new(
            vec![Ok(RecordBatch::new_empty(arrow_schema.clone()))],
            arrow_schema,
        );
        match conn.create_table(table, empty).execute().await {
            Ok(created) => {
                tracing::info!(scope = %scope, table, dims = schema.dims, layout = ?schema.layout, "vector table created");
                Ok(created)
            }
            // Lost a creation race: the winner's schema decides.
            Err(lancedb::Error::TableAlreadyExists { .. }) => {
                let existing = conn.open_table(table).execute().await?;
                verify_schema(existing, table, schema).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Schema of an existing table, or `None` if the table does not exist.
    pub async fn table_schema(&self, scope: &Scope, table: &str) -> VaultResult<Option<VectorSchema>> {
        let Some(t) = self.open(scope, table).await? else {
            return Ok(None);
        };
        let arrow_schema = t.schema().await?;
        VectorSchema::from_arrow(&arrow_schema)
            .map(Some)
            .ok_or_else(|| VaultError::SchemaMismatch {
                table: table.to_string(),
                detail: "not a document vector table".to_string(),
            })
    }

    /// Append records. The table must exist; records must fit its schema.
    pub async fn add(&self, scope: &Scope, table: &str, records: &[EmbeddedRecord]) -> VaultResult<usize> {
        let t = self
            .open(scope, table)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("vector table '{}'", table)))?;
        if records.is_empty() {
            return Ok(0);
        }

        let arrow_schema = t.schema().await?;
        let schema = VectorSchema::from_arrow(&arrow_schema).ok_or_else(|| VaultError::SchemaMismatch {
            table: table.to_string(),
            detail: "not a document vector table".to_string(),
        })?;

        let batch = records::records_to_batch(table, &schema, records)?;
        let rows = batch.num_rows();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema.arrow());
        t.add(reader).execute().await?;

        tracing::debug!(scope = %scope, table, rows, "vector rows added");
        Ok(rows)
    }

    /// Delete rows matching `predicate`; returns how many were removed.
    /// A missing table has nothing to delete.
    pub async fn delete_where(&self, scope: &Scope, table: &str, predicate: &Predicate) -> VaultResult<usize> {
        let filter = render(predicate)?;
        let Some(t) = self.open(scope, table).await? else {
            return Ok(0);
        };

        let matching = t.count_rows(Some(filter.clone())).await?;
        if matching == 0 {
            return Ok(0);
        }
        t.delete(&filter).await?;

        tracing::debug!(scope = %scope, table, filter = %filter, rows = matching, "vector rows deleted");
        Ok(matching)
    }

    /// Rows matching `predicate`, or all rows when `None`.
    pub async fn count(&self, scope: &Scope, table: &str, predicate: Option<&Predicate>) -> VaultResult<usize> {
        let filter = predicate.map(render).transpose()?;
        match self.open(scope, table).await? {
            Some(t) => Ok(t.count_rows(filter).await?),
            None => Ok(0),
        }
    }

    /// Top-`k` rows by cosine distance to `query`. The filter narrows the
    /// candidate set before ranking, so `k` hits are returned whenever `k`
    /// rows match.
    pub async fn search(
        &self,
        scope: &Scope,
        table: &str,
        query: &[f32],
        k: usize,
        filter: Option<&Predicate>,
    ) -> VaultResult<Vec<SearchHit>> {
        let filter = filter.map(render).transpose()?;
        let Some(t) = self.open(scope, table).await? else {
            return Ok(Vec::new());
        };
        if k == 0 || t.count_rows(filter.clone()).await? == 0 {
            return Ok(Vec::new());
        }

        if let Some(schema) = VectorSchema::from_arrow(&*t.schema().await?) {
            if schema.dims != query.len() {
                return Err(VaultError::InvalidInput(format!(
                    "query has {} dimensions, table '{}' has {}",
                    query.len(),
                    table,
                    schema.dims
                )));
            }
        }

        let mut q = t
            .vector_search(query)?
            .column(schema::VECTOR)
            .distance_type(DistanceType::Cosine)
            .limit(k);
        if let Some(f) = filter {
            q = q.only_if(f);
        }

        let batches: Vec<_> = q.execute().await?.try_collect().await?;
        let mut hits = Vec::new();
        for batch in &batches {
            hits.extend(records::batch_to_hits(batch)?);
        }
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }
}

async fn verify_schema(existing: Table, table: &str, wanted: &VectorSchema) -> VaultResult<Table> {
    let found = existing.schema().await?;
    match wanted.diff(&found) {
        None => Ok(existing),
        Some(detail) => Err(VaultError::SchemaMismatch {
            table: table.to_string(),
            detail,
        }),
    }
}

fn check_table_name(table: &str) -> VaultResult<()> {
    schema::validate_table_name(table).map_err(VaultError::InvalidInput)
}

fn render(predicate: &Predicate) -> VaultResult<String> {
    predicate.render().map_err(VaultError::InvalidInput)
}
