//! Tenant store registry.
//!
//! Resolves a [`Scope`] to the one physical store that backs it and hands out
//! per-request [`TenantConnection`]s. The registry is an explicit object owned
//! by the process (the server keeps one in its state, the CLI builds one per
//! command); entries are created on first use and kept for the lifetime of the
//! registry.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── shared/
//! │   ├── shared.sqlite3
//! │   └── lancedb/
//! └── userdbs/
//!     └── <tenant>/
//!         ├── <tenant>.sqlite3
//!         └── lancedb/
//! ```
//!
//! Nothing here ever deletes or truncates a store.

use sqlx::sqlite::SqliteConnectOptions;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tenant_vault_core::models::Scope;

use crate::config::StorageConfig;
use crate::db::{self, TenantConnection};
use crate::error::{VaultError, VaultResult};
use crate::migrate::{MigrationReport, Migrator};

/// Handle to one scope's relational store and vector root.
pub struct TenantStore {
    scope: Scope,
    db_path: PathBuf,
    vector_root: PathBuf,
    options: SqliteConnectOptions,
    migration_gate: tokio::sync::Mutex<()>,
}

impl TenantStore {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn vector_root(&self) -> &Path {
        &self.vector_root
    }

    /// Open a fresh connection. Release it at the end of the request.
    pub async fn connect(&self) -> VaultResult<TenantConnection> {
        TenantConnection::open(self.scope.clone(), &self.options).await
    }

    /// Serializes migration attempts on this store within the process.
    pub(crate) fn migration_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.migration_gate
    }
}

pub struct TenantRegistry {
    root: PathBuf,
    busy_timeout: Duration,
    migrator: Migrator,
    stores: Mutex<HashMap<Scope, Arc<TenantStore>>>,
}

impl TenantRegistry {
    pub fn new(root: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self::with_migrator(root, busy_timeout, Migrator::tenant_schema())
    }

    /// Registry whose stores are migrated with a custom catalog.
    pub fn with_migrator(
        root: impl Into<PathBuf>,
        busy_timeout: Duration,
        migrator: Migrator,
    ) -> Self {
        Self {
            root: root.into(),
            busy_timeout,
            migrator,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            config.root.clone(),
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    /// Directory holding everything that belongs to `scope`.
    pub fn scope_dir(&self, scope: &Scope) -> PathBuf {
        match scope {
            Scope::Shared => self.root.join("shared"),
            Scope::Tenant(id) => self.root.join("userdbs").join(id.as_str()),
        }
    }

    /// Vector-index root for `scope`. Pure path computation, no I/O.
    pub fn vector_root(&self, scope: &Scope) -> PathBuf {
        self.scope_dir(scope).join("lancedb")
    }

    /// Whether `scope` has been provisioned. Never creates anything.
    pub fn store_exists(&self, scope: &Scope) -> bool {
        self.db_path(scope).is_file()
    }

    fn db_path(&self, scope: &Scope) -> PathBuf {
        let file = match scope {
            Scope::Shared => "shared.sqlite3".to_string(),
            Scope::Tenant(id) => format!("{}.sqlite3", id),
        };
        self.scope_dir(scope).join(file)
    }

    /// Get or create the store for `scope`.
    ///
    /// The first call for a scope creates its directory and database file.
    /// Concurrent first calls race on creation, but all of them end up
    /// sharing the single handle that wins the registration.
    pub async fn resolve(&self, scope: &Scope) -> VaultResult<Arc<TenantStore>> {
        if let Some(store) = self.lookup(scope) {
            return Ok(store);
        }

        let dir = self.scope_dir(scope);
        std::fs::create_dir_all(&dir).map_err(|e| VaultError::storage(&dir, e))?;

        let db_path = self.db_path(scope);
        let options = db::connect_options(&db_path, self.busy_timeout);

        // Touch the file so the store exists before anyone migrates it.
        TenantConnection::open(scope.clone(), &options)
            .await?
            .close()
            .await
            .map_err(|e| VaultError::storage(&db_path, e))?;

        let store = Arc::new(TenantStore {
            scope: scope.clone(),
            db_path,
            vector_root: self.vector_root(scope),
            options,
            migration_gate: tokio::sync::Mutex::new(()),
        });

        let mut stores = self.stores.lock().unwrap_or_else(|p| p.into_inner());
        let store = match stores.entry(scope.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                tracing::info!(scope = %scope, path = %store.db_path.display(), "tenant store registered");
                slot.insert(store).clone()
            }
        };
        Ok(store)
    }

    /// Resolve `scope`, connect, and bring the schema up to date.
    ///
    /// This is what every request handler calls before touching the store.
    pub async fn open(&self, scope: &Scope) -> VaultResult<(TenantConnection, MigrationReport)> {
        let store = self.resolve(scope).await?;
        let mut conn = store.connect().await?;
        let report = self.migrator.migrate(&store, &mut conn).await?;
        Ok((conn, report))
    }

    /// Number of registered stores.
    pub fn len(&self) -> usize {
        self.stores.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, scope: &Scope) -> Option<Arc<TenantStore>> {
        self.stores
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(scope)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(tmp: &TempDir) -> TenantRegistry {
        TenantRegistry::new(tmp.path(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_resolve_creates_store_on_first_use() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let scope = Scope::tenant("u1").unwrap();

        let store = reg.resolve(&scope).await.unwrap();
        assert!(store.db_path().exists());
        assert_eq!(
            store.db_path(),
            tmp.path().join("userdbs").join("u1").join("u1.sqlite3")
        );
        assert_eq!(
            store.vector_root(),
            tmp.path().join("userdbs").join("u1").join("lancedb")
        );
    }

    #[tokio::test]
    async fn test_resolve_twice_returns_same_handle() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let scope = Scope::tenant("u1").unwrap();

        let a = reg.resolve(&scope).await.unwrap();
        let b = reg.resolve(&scope).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn test_separate_registries_share_physical_store() {
        let tmp = TempDir::new().unwrap();
        let scope = Scope::tenant("u1").unwrap();

        let first = registry(&tmp);
        let (mut conn, _) = first.open(&scope).await.unwrap();
        sqlx::query("INSERT INTO agent_personas (persona_name, persona_data) VALUES ('p', '{}')")
            .execute(conn.ready().await.unwrap())
            .await
            .unwrap();
        conn.close().await.unwrap();

        let second = registry(&tmp);
        let (mut conn, _) = second.open(&scope).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agent_personas")
            .fetch_one(conn.ready().await.unwrap())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_store_exists_does_not_provision() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let scope = Scope::tenant("typo").unwrap();

        assert!(!reg.store_exists(&scope));
        assert!(!reg.scope_dir(&scope).exists());

        reg.resolve(&scope).await.unwrap();
        assert!(reg.store_exists(&scope));
    }

    #[tokio::test]
    async fn test_shared_scope_lives_apart_from_tenants() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let store = reg.resolve(&Scope::Shared).await.unwrap();
        assert_eq!(
            store.db_path(),
            tmp.path().join("shared").join("shared.sqlite3")
        );
    }

    #[tokio::test]
    async fn test_unwritable_root_is_storage_unavailable() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let reg = TenantRegistry::new(&file, Duration::from_secs(1));
        let err = reg
            .resolve(&Scope::tenant("u1").unwrap())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "storage_unavailable");
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_first_resolve_registers_once() {
        let tmp = TempDir::new().unwrap();
        let reg = Arc::new(registry(&tmp));
        let scope = Scope::tenant("racer").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            let scope = scope.clone();
            handles.push(tokio::spawn(async move { reg.resolve(&scope).await }));
        }
        let mut stores = Vec::new();
        for h in handles {
            stores.push(h.await.unwrap().unwrap());
        }
        assert!(stores.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(reg.len(), 1);
    }
}
