//! The process-wide handle request handlers work through.

use std::sync::Arc;

use tenant_vault_core::embedding::Embedder;

use crate::config::{Config, RetrievalConfig};
use crate::embedding::create_embedder;
use crate::error::{VaultError, VaultResult};
use crate::registry::TenantRegistry;
use crate::vector::VectorRouter;

/// Registry, vector router and embedder for one process.
///
/// Built once at startup (or once per CLI command) and shared by reference;
/// there is no global state behind it.
pub struct Vault {
    registry: Arc<TenantRegistry>,
    vectors: VectorRouter,
    embedder: Option<Arc<dyn Embedder>>,
    fan_out: usize,
    retrieval: RetrievalConfig,
}

impl Vault {
    pub fn new(
        registry: Arc<TenantRegistry>,
        embedder: Option<Arc<dyn Embedder>>,
        fan_out: usize,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            vectors: VectorRouter::new(registry.clone()),
            registry,
            embedder,
            fan_out,
            retrieval,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let registry = Arc::new(TenantRegistry::from_config(&config.storage));
        let embedder = create_embedder(&config.embedding)?;
        Ok(Self::new(
            registry,
            embedder,
            config.embedding.fan_out(),
            config.retrieval.clone(),
        ))
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    pub fn vectors(&self) -> &VectorRouter {
        &self.vectors
    }

    /// The configured embedder; requests that need one fail when disabled.
    pub fn embedder(&self) -> VaultResult<&dyn Embedder> {
        self.embedder
            .as_deref()
            .ok_or_else(|| VaultError::InvalidInput("embedding provider is disabled".to_string()))
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    /// Clamp a requested result count to the configured bounds.
    pub fn result_count(&self, requested: Option<usize>) -> VaultResult<usize> {
        match requested {
            None => Ok(self.retrieval.default_k),
            Some(0) => Err(VaultError::InvalidInput("k must be >= 1".to_string())),
            Some(k) => Ok(k.min(self.retrieval.max_k)),
        }
    }
}
