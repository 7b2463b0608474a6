//! Migration session: a transaction with foreign-key enforcement relaxed.
//!
//! Schema rebuilds (create new table, copy, drop old, rename) transiently
//! break references, so SQLite's own advice is to switch foreign keys off
//! around them. The pragma is ignored inside a transaction, which fixes the
//! order of operations:
//!
//! ```text
//! begin:    PRAGMA foreign_keys = OFF  →  BEGIN IMMEDIATE
//! commit:   PRAGMA foreign_key_check   →  COMMIT    →  PRAGMA foreign_keys = ON
//! rollback:                               ROLLBACK  →  PRAGMA foreign_keys = ON
//! ```
//!
//! `BEGIN IMMEDIATE` takes the database write lock up front, so two
//! processes migrating the same store serialize on it instead of failing
//! half-way with a lock upgrade error.
//!
//! If a session is dropped without `commit` or `rollback` (the request future
//! was cancelled), the connection remembers that it is still relaxed and
//! [`TenantConnection::ready`] rolls back and re-enables enforcement before any
//! application query can run on it.

use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

use crate::db::{Integrity, TenantConnection};
use crate::error::{VaultError, VaultResult};

pub struct MigrationSession<'c> {
    conn: &'c mut TenantConnection,
}

impl<'c> MigrationSession<'c> {
    pub async fn begin(conn: &'c mut TenantConnection) -> VaultResult<Self> {
        conn.ready().await?;

        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(conn.raw())
            .await?;
        conn.set_integrity(Integrity::Relaxed);

        if let Err(e) = sqlx::query("BEGIN IMMEDIATE").execute(conn.raw()).await {
            conn.restore_integrity().await?;
            return Err(e.into());
        }
        conn.set_integrity(Integrity::RelaxedInTransaction);

        Ok(Self { conn })
    }

    /// Connection to run migration statements on.
    pub fn executor(&mut self) -> &mut SqliteConnection {
        self.conn.raw()
    }

    /// Verify references, commit, and re-enable enforcement.
    ///
    /// Any dangling reference left by the session aborts the whole
    /// transaction instead of being committed.
    pub async fn commit(mut self) -> VaultResult<()> {
        let violations = sqlx::query("PRAGMA foreign_key_check")
            .fetch_all(self.conn.raw())
            .await;

        let violations = match violations {
            Ok(rows) => rows,
            Err(e) => {
                self.conn.restore_integrity().await?;
                return Err(e.into());
            }
        };

        if !violations.is_empty() {
            let mut tables: Vec<String> = violations
                .iter()
                .filter_map(|row| row.try_get::<String, _>(0).ok())
                .collect();
            tables.sort();
            tables.dedup();
            self.conn.restore_integrity().await?;
            return Err(VaultError::migration(
                "foreign_key_check",
                format!(
                    "{} dangling reference(s) in {}",
                    violations.len(),
                    tables.join(", ")
                ),
            ));
        }

        if let Err(e) = sqlx::query("COMMIT").execute(self.conn.raw()).await {
            self.conn.restore_integrity().await?;
            return Err(e.into());
        }
        self.conn.set_integrity(Integrity::Relaxed);
        self.conn.restore_integrity().await
    }

    /// Discard everything the session did and re-enable enforcement.
    pub async fn rollback(mut self) -> VaultResult<()> {
        self.conn.restore_integrity().await
    }
}

impl Drop for MigrationSession<'_> {
    fn drop(&mut self) {
        if self.conn.integrity() != Integrity::Enforced {
            tracing::warn!(
                scope = %self.conn.scope(),
                "migration session dropped before completion; integrity restored on next use"
            );
        }
    }
}
