//! Embedding trait.
//!
//! Concrete HTTP embedders live in the `tenant-vault` app crate; the
//! ingestion pipeline and search only see [`Embedder`].

use anyhow::Result;
use async_trait::async_trait;

/// A service that turns one piece of text into one fixed-length vector.
///
/// Implementations are called concurrently from the ingestion fan-out, so
/// they must be `Send + Sync` and must not assume any call ordering.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
