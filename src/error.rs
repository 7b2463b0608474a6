//! Error taxonomy for the storage core.
//!
//! Every failure that can reach a caller maps to one [`VaultError`] variant
//! with a stable machine-readable [`kind`](VaultError::kind). The HTTP layer
//! turns that code into the `{ "error": { "code", "message" } }` body; the CLI
//! just prints the message.

use std::path::PathBuf;
use thiserror::Error;

use tenant_vault_core::models::InvalidTenantId;

#[derive(Debug, Error)]
pub enum VaultError {
    /// The tenant's store location could not be created or opened.
    #[error("storage unavailable at {}: {reason}", path.display())]
    StorageUnavailable { path: PathBuf, reason: String },

    /// A schema upgrade was aborted; the store is still at its prior version.
    #[error("migration {migration} failed: {reason}")]
    MigrationFailed { migration: String, reason: String },

    /// A vector table exists with a schema other than the requested one.
    #[error("schema mismatch on table '{table}': {detail}")]
    SchemaMismatch { table: String, detail: String },

    /// The embedding service failed for one chunk of a batch.
    #[error("embedding request failed for chunk {chunk}: {reason}")]
    EmbeddingRequestFailed { chunk: String, reason: String },

    #[error("{0}")]
    InvalidTenant(#[from] InvalidTenantId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("vector index error: {0}")]
    VectorIndex(#[from] lancedb::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

pub type VaultResult<T> = Result<T, VaultError>;

impl VaultError {
    /// Stable code identifying the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            VaultError::StorageUnavailable { .. } => "storage_unavailable",
            VaultError::MigrationFailed { .. } => "migration_failed",
            VaultError::SchemaMismatch { .. } => "schema_mismatch",
            VaultError::EmbeddingRequestFailed { .. } => "embedding_request_failed",
            VaultError::InvalidTenant(_) => "invalid_tenant",
            VaultError::InvalidInput(_) => "bad_request",
            VaultError::NotFound(_) => "not_found",
            VaultError::Database(_) => "database",
            VaultError::VectorIndex(_) => "vector_index",
            VaultError::Arrow(_) => "internal",
        }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        VaultError::StorageUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn migration(migration: impl Into<String>, reason: impl ToString) -> Self {
        VaultError::MigrationFailed {
            migration: migration.into(),
            reason: reason.to_string(),
        }
    }
}
