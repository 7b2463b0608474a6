//! Schema migration coordinator for tenant stores.
//!
//! Every request calls [`Migrator::migrate`] on its connection before doing
//! anything else, so the common case must be cheap: one read of the
//! `schema_migrations` ledger, compared against the leaves of the migration
//! graph. Only a store that is behind pays for the write path.
//!
//! # Write path
//!
//! 1. Take the store's in-process migration gate (one migrator per store at a
//!    time inside this process).
//! 2. Open a [`MigrationSession`]: foreign keys off, `BEGIN IMMEDIATE`. This
//!    holds the database write lock, which also serializes other processes.
//! 3. Create the ledger if it is missing, then re-read it. Whoever lost the
//!    race to the lock sees the winner's rows here and has nothing to do.
//! 4. Apply each outstanding migration in dependency order, recording its id
//!    in the ledger inside the same transaction.
//! 5. Commit. Any failure rolls back the whole plan, leaving the store at the
//!    version it had before the call.

use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use std::collections::HashSet;

use tenant_vault_core::migration::{GraphError, Migration, MigrationGraph};

use crate::db::TenantConnection;
use crate::error::{VaultError, VaultResult};
use crate::registry::TenantStore;
use crate::session::MigrationSession;

/// The schema every tenant (and the shared scope) runs on.
pub const TENANT_MIGRATIONS: &[Migration] = &[
    Migration {
        id: "0001_initial",
        depends_on: &[],
        statements: &[
            r#"
            CREATE TABLE documents (
                doc_id TEXT PRIMARY KEY,
                title TEXT,
                file_type TEXT NOT NULL,
                vector_table TEXT NOT NULL,
                display_date INTEGER NOT NULL,
                expire_date INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX idx_documents_vector_table ON documents(vector_table)",
        ],
    },
    Migration {
        id: "0002_document_chunks",
        depends_on: &["0001_initial"],
        statements: &[r#"
            CREATE TABLE document_chunks (
                doc_id TEXT NOT NULL REFERENCES documents(doc_id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                page_id INTEGER,
                chunk_id INTEGER,
                start_sec REAL,
                end_sec REAL,
                content TEXT NOT NULL,
                PRIMARY KEY (doc_id, seq)
            )
            "#],
    },
    Migration {
        id: "0003_chat_logs",
        depends_on: &["0001_initial"],
        statements: &[
            r#"
            CREATE TABLE user_chat_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                doc_id TEXT,
                dialog_session_id TEXT NOT NULL UNIQUE,
                dialog_text TEXT,
                dialog_meta TEXT,
                create_time INTEGER NOT NULL,
                last_update_time INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX idx_chat_logs_create_time ON user_chat_logs(create_time DESC)",
        ],
    },
    Migration {
        id: "0004_agent_personas",
        depends_on: &["0001_initial"],
        statements: &[r#"
            CREATE TABLE agent_personas (
                persona_name TEXT PRIMARY KEY,
                persona_data TEXT NOT NULL
            )
            "#],
    },
    Migration {
        id: "0005_user_activities",
        depends_on: &["0001_initial"],
        statements: &[r#"
            CREATE TABLE user_activities (
                activity_id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                activity_desc TEXT,
                create_date INTEGER NOT NULL,
                finish_date INTEGER,
                check_flag INTEGER NOT NULL DEFAULT 0,
                UNIQUE (user_id, session_id)
            )
            "#],
    },
    // Adding a CHECK constraint means rebuilding `documents`. Dropping the old
    // table with foreign keys on would cascade into document_chunks.
    Migration {
        id: "0006_documents_window_check",
        depends_on: &["0002_document_chunks"],
        statements: &[
            r#"
            CREATE TABLE documents_new (
                doc_id TEXT PRIMARY KEY,
                title TEXT,
                file_type TEXT NOT NULL,
                vector_table TEXT NOT NULL,
                display_date INTEGER NOT NULL,
                expire_date INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                CHECK (expire_date >= display_date)
            )
            "#,
            r#"
            INSERT INTO documents_new
            SELECT doc_id, title, file_type, vector_table, display_date,
                   MAX(expire_date, display_date), created_at, updated_at
            FROM documents
            "#,
            "DROP TABLE documents",
            "ALTER TABLE documents_new RENAME TO documents",
            "CREATE INDEX idx_documents_vector_table ON documents(vector_table)",
        ],
    },
];

const CREATE_LEDGER: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        id TEXT PRIMARY KEY,
        seq INTEGER NOT NULL,
        applied_at INTEGER NOT NULL
    )
"#;

/// What a [`Migrator::migrate`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Ids applied by this call, in order. Empty when the store was current.
    pub applied: Vec<String>,
    /// True when the store had no ledger before this call.
    pub fresh_store: bool,
}

/// Ledger contents of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    /// Applied ids in application order.
    pub applied: Vec<String>,
    /// Leaves of the graph that are not applied yet.
    pub missing_leaves: Vec<String>,
}

impl MigrationStatus {
    pub fn is_current(&self) -> bool {
        self.missing_leaves.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Migrator {
    graph: MigrationGraph,
}

impl Migrator {
    pub fn new(catalog: &[Migration]) -> Result<Self, GraphError> {
        Ok(Self {
            graph: MigrationGraph::new(catalog)?,
        })
    }

    /// Migrator for [`TENANT_MIGRATIONS`].
    pub fn tenant_schema() -> Self {
        // The built-in catalog is covered by `test_tenant_catalog_is_valid`.
        Self::new(TENANT_MIGRATIONS).expect("built-in migration catalog is a valid graph")
    }

    pub fn graph(&self) -> &MigrationGraph {
        &self.graph
    }

    /// Read the ledger without changing anything.
    pub async fn status(&self, conn: &mut TenantConnection) -> VaultResult<MigrationStatus> {
        let applied = read_ledger(conn.ready().await?).await?.unwrap_or_default();
        let set: HashSet<String> = applied.iter().cloned().collect();
        Ok(MigrationStatus {
            missing_leaves: self
                .graph
                .missing_leaves(&set)
                .into_iter()
                .map(String::from)
                .collect(),
            applied,
        })
    }

    /// Bring the store behind `conn` up to date. Safe to call on every request.
    pub async fn migrate(
        &self,
        store: &TenantStore,
        conn: &mut TenantConnection,
    ) -> VaultResult<MigrationReport> {
        if let Some(applied) = read_ledger(conn.ready().await?).await? {
            let applied: HashSet<String> = applied.into_iter().collect();
            if self.graph.is_current(&applied) {
                return Ok(MigrationReport::default());
            }
            tracing::info!(
                scope = %store.scope(),
                missing = ?self.graph.missing_leaves(&applied),
                "tenant store is behind"
            );
        }

        let _gate = store.migration_gate().lock().await;

        let mut session = MigrationSession::begin(conn)
            .await
            .map_err(|e| VaultError::migration("schema_migrations", e))?;

        let plan = match self.plan(session.executor()).await {
            Ok(plan) => plan,
            Err(e) => {
                session.rollback().await?;
                return Err(e);
            }
        };

        let mut applied = Vec::with_capacity(plan.outstanding.len());
        let mut seq = plan.next_seq;
        for migration in &plan.outstanding {
            if let Err(reason) = apply_one(session.executor(), migration, seq).await {
                session.rollback().await?;
                tracing::error!(
                    scope = %store.scope(),
                    migration = migration.id,
                    error = %reason,
                    "migration failed; store left at prior version"
                );
                return Err(VaultError::migration(migration.id, reason));
            }
            applied.push(migration.id.to_string());
            seq += 1;
        }

        let last = applied
            .last()
            .cloned()
            .unwrap_or_else(|| "schema_migrations".to_string());
        session.commit().await.map_err(|e| match e {
            VaultError::MigrationFailed { .. } => e,
            other => VaultError::migration(last, other),
        })?;

        if !applied.is_empty() {
            tracing::info!(
                scope = %store.scope(),
                fresh = plan.fresh_store,
                applied = ?applied,
                "migrations applied"
            );
        }

        Ok(MigrationReport {
            applied,
            fresh_store: plan.fresh_store,
        })
    }

    /// Re-read the ledger under the write lock and work out what to run.
    async fn plan(&self, conn: &mut SqliteConnection) -> VaultResult<Plan> {
        let existing = read_ledger(&mut *conn).await?;
        let fresh_store = existing.is_none();

        sqlx::query(CREATE_LEDGER)
            .execute(&mut *conn)
            .await
            .map_err(|e| VaultError::migration("schema_migrations", e))?;

        let applied: HashSet<String> = existing.unwrap_or_default().into_iter().collect();
        let next_seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) + 1 FROM schema_migrations")
            .fetch_one(&mut *conn)
            .await?;

        Ok(Plan {
            outstanding: self.graph.outstanding(&applied),
            next_seq,
            fresh_store,
        })
    }
}

struct Plan {
    outstanding: Vec<Migration>,
    next_seq: i64,
    fresh_store: bool,
}

/// Applied ids in order, or `None` when the ledger table does not exist.
async fn read_ledger(conn: &mut SqliteConnection) -> VaultResult<Option<Vec<String>>> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
    )
    .fetch_one(&mut *conn)
    .await?;

    if !exists {
        return Ok(None);
    }

    let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM schema_migrations ORDER BY seq")
        .fetch_all(&mut *conn)
        .await?;
    Ok(Some(ids))
}

async fn apply_one(
    conn: &mut SqliteConnection,
    migration: &Migration,
    seq: i64,
) -> Result<(), sqlx::Error> {
    let already: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM schema_migrations WHERE id = ?")
            .bind(migration.id)
            .fetch_one(&mut *conn)
            .await?;
    if already {
        return Ok(());
    }

    for statement in migration.statements {
        sqlx::query(statement).execute(&mut *conn).await?;
    }

    sqlx::query("INSERT INTO schema_migrations (id, seq, applied_at) VALUES (?, ?, ?)")
        .bind(migration.id)
        .bind(seq)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TenantRegistry;
    use std::time::Duration;
    use tempfile::TempDir;
    use tenant_vault_core::models::Scope;

    fn all_ids() -> Vec<String> {
        TENANT_MIGRATIONS.iter().map(|m| m.id.to_string()).collect()
    }

    #[test]
    fn test_tenant_catalog_is_valid() {
        let graph = MigrationGraph::new(TENANT_MIGRATIONS).unwrap();
        assert_eq!(graph.ordered().len(), TENANT_MIGRATIONS.len());
        assert_eq!(
            graph.leaves(),
            &[
                "0003_chat_logs",
                "0004_agent_personas",
                "0005_user_activities",
                "0006_documents_window_check"
            ]
        );
    }

    #[tokio::test]
    async fn test_fresh_store_gets_full_sequence() {
        let tmp = TempDir::new().unwrap();
        let reg = TenantRegistry::new(tmp.path(), Duration::from_secs(5));
        let (mut conn, report) = reg.open(&Scope::tenant("u1").unwrap()).await.unwrap();

        assert!(report.fresh_store);
        assert_eq!(report.applied, all_ids());

        let status = reg.migrator().status(&mut conn).await.unwrap();
        assert!(status.is_current());
        assert_eq!(status.applied, all_ids());
        assert!(conn.foreign_keys_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_second_call_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let reg = TenantRegistry::new(tmp.path(), Duration::from_secs(5));
        let scope = Scope::tenant("u1").unwrap();

        reg.open(&scope).await.unwrap();
        let (_, report) = reg.open(&scope).await.unwrap();
        assert_eq!(report, MigrationReport::default());
    }

    #[tokio::test]
    async fn test_store_behind_gets_only_outstanding() {
        let tmp = TempDir::new().unwrap();
        let scope = Scope::tenant("u1").unwrap();

        // An older release shipped only the first three migrations.
        let old = Migrator::new(&TENANT_MIGRATIONS[..3]).unwrap();
        let old_reg = TenantRegistry::with_migrator(tmp.path(), Duration::from_secs(5), old);
        let (_, report) = old_reg.open(&scope).await.unwrap();
        assert_eq!(report.applied.len(), 3);

        let reg = TenantRegistry::new(tmp.path(), Duration::from_secs(5));
        let (mut conn, report) = reg.open(&scope).await.unwrap();
        assert!(!report.fresh_store);
        assert_eq!(
            report.applied,
            vec![
                "0004_agent_personas",
                "0005_user_activities",
                "0006_documents_window_check"
            ]
        );

        let seqs: Vec<i64> = sqlx::query_scalar("SELECT seq FROM schema_migrations ORDER BY seq")
            .fetch_all(conn.ready().await.unwrap())
            .await
            .unwrap();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_rebuild_keeps_child_rows() {
        let tmp = TempDir::new().unwrap();
        let scope = Scope::tenant("u1").unwrap();

        let old = Migrator::new(&TENANT_MIGRATIONS[..2]).unwrap();
        let old_reg = TenantRegistry::with_migrator(tmp.path(), Duration::from_secs(5), old);
        let (mut conn, _) = old_reg.open(&scope).await.unwrap();
        {
            let c = conn.ready().await.unwrap();
            sqlx::query(
                "INSERT INTO documents VALUES ('d1', 't', 'pdf', 'KnowledgeObject_table', 10, 5, 0, 0)",
            )
            .execute(&mut *c)
            .await
            .unwrap();
            sqlx::query("INSERT INTO document_chunks (doc_id, seq, page_id, content) VALUES ('d1', 0, 0, 'A')")
                .execute(&mut *c)
                .await
                .unwrap();
        }
        conn.close().await.unwrap();

        let reg = TenantRegistry::new(tmp.path(), Duration::from_secs(5));
        let (mut conn, _) = reg.open(&scope).await.unwrap();
        let c = conn.ready().await.unwrap();
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks")
            .fetch_one(&mut *c)
            .await
            .unwrap();
        assert_eq!(chunks, 1, "rebuilding documents must not cascade into chunks");
        let expire: i64 = sqlx::query_scalar("SELECT expire_date FROM documents WHERE doc_id = 'd1'")
            .fetch_one(&mut *c)
            .await
            .unwrap();
        assert_eq!(expire, 10);
    }

    const BROKEN: &[Migration] = &[
        Migration {
            id: "0001_ok",
            depends_on: &[],
            statements: &["CREATE TABLE first (id INTEGER PRIMARY KEY)"],
        },
        Migration {
            id: "0002_broken",
            depends_on: &["0001_ok"],
            statements: &["CREATE TABLE second (id INTEGER PRIMARY KEY)", "THIS IS NOT SQL"],
        },
    ];

    #[tokio::test]
    async fn test_failed_migration_leaves_prior_state() {
        let tmp = TempDir::new().unwrap();
        let scope = Scope::tenant("u1").unwrap();
        let reg = TenantRegistry::with_migrator(
            tmp.path(),
            Duration::from_secs(5),
            Migrator::new(BROKEN).unwrap(),
        );

        let err = reg.open(&scope).await.err().unwrap();
        match &err {
            VaultError::MigrationFailed { migration, .. } => assert_eq!(migration, "0002_broken"),
            other => panic!("expected MigrationFailed, got {:?}", other),
        }

        let store = reg.resolve(&scope).await.unwrap();
        let mut conn = store.connect().await.unwrap();
        assert!(conn.foreign_keys_enabled().await.unwrap());
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('first', 'second', 'schema_migrations')",
        )
        .fetch_all(conn.ready().await.unwrap())
        .await
        .unwrap();
        assert!(tables.is_empty(), "nothing may persist, found {:?}", tables);
    }
}
