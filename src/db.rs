//! Per-request connections to a tenant store.
//!
//! A [`TenantConnection`] wraps one SQLite connection together with the
//! state of its foreign-key enforcement. Migration sessions relax that
//! enforcement; application code only ever reaches the raw connection through
//! [`TenantConnection::ready`], which restores enforcement first if a session
//! was abandoned half-way (for example because the request was cancelled).

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection};
use std::path::Path;
use std::time::Duration;

use tenant_vault_core::models::Scope;

use crate::error::{VaultError, VaultResult};

/// Foreign-key state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Integrity {
    Enforced,
    Relaxed,
    RelaxedInTransaction,
}

pub(crate) fn connect_options(db_path: &Path, busy_timeout: Duration) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(busy_timeout)
}

pub struct TenantConnection {
    scope: Scope,
    conn: SqliteConnection,
    integrity: Integrity,
}

impl TenantConnection {
    pub(crate) async fn open(scope: Scope, options: &SqliteConnectOptions) -> VaultResult<Self> {
        let conn = options
            .connect()
            .await
            .map_err(|e| VaultError::storage(options.get_filename(), e))?;
        Ok(Self {
            scope,
            conn,
            integrity: Integrity::Enforced,
        })
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The connection, with foreign keys enforced, for application queries.
    pub async fn ready(&mut self) -> VaultResult<&mut SqliteConnection> {
        if self.integrity != Integrity::Enforced {
            tracing::warn!(scope = %self.scope, "restoring integrity after abandoned migration session");
            self.restore_integrity().await?;
        }
        Ok(&mut self.conn)
    }

    /// Whether SQLite currently enforces foreign keys on this connection.
    pub async fn foreign_keys_enabled(&mut self) -> VaultResult<bool> {
        let on: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&mut self.conn)
            .await?;
        Ok(on == 1)
    }

    pub async fn close(self) -> VaultResult<()> {
        self.conn.close().await?;
        Ok(())
    }

    pub(crate) fn raw(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    pub(crate) fn integrity(&self) -> Integrity {
        self.integrity
    }

    pub(crate) fn set_integrity(&mut self, integrity: Integrity) {
        self.integrity = integrity;
    }

    /// Roll back any open session transaction and turn foreign keys back on.
    pub(crate) async fn restore_integrity(&mut self) -> VaultResult<()> {
        if self.integrity == Integrity::RelaxedInTransaction {
            sqlx::query("ROLLBACK").execute(&mut self.conn).await?;
            self.integrity = Integrity::Relaxed;
        }
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut self.conn)
            .await?;
        self.integrity = Integrity::Enforced;
        Ok(())
    }
}
