//! Data models shared by the ingestion pipeline and the vector router.
//!
//! A [`ContentChunk`] is what document ingestion hands us; an
//! [`EmbeddedRecord`] is that chunk plus its vector and the parent document's
//! validity window, ready for the vector index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a single tenant.
///
/// Tenant ids end up as a path component on disk, so construction rejects
/// anything that is not a plain file name: empty strings, `.`/`..`, and any
/// character outside ASCII alphanumerics, `-`, `_` and `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: &str) -> Result<Self, InvalidTenantId> {
        let ok = !raw.is_empty()
            && raw != "."
            && raw != ".."
            && raw.len() <= 128
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if ok {
            Ok(Self(raw.to_string()))
        } else {
            Err(InvalidTenantId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returned by [`TenantId::parse`] for ids that cannot name a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTenantId(pub String);

impl fmt::Display for InvalidTenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid tenant id: {:?}", self.0)
    }
}

impl std::error::Error for InvalidTenantId {}

/// Namespace a store or vector index belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// The cross-tenant master knowledge base.
    Shared,
    Tenant(TenantId),
}

impl Scope {
    pub fn tenant(raw: &str) -> Result<Self, InvalidTenantId> {
        TenantId::parse(raw).map(Scope::Tenant)
    }

    /// Value written to the `user_id` column of vector rows.
    pub fn owner(&self) -> &str {
        match self {
            Scope::Shared => "shared",
            Scope::Tenant(id) => id.as_str(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Shared => f.write_str("shared"),
            Scope::Tenant(id) => write!(f, "tenant:{}", id),
        }
    }
}

/// Where a chunk sits inside its source document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkPosition {
    /// Page-based documents (PDF, text).
    Page { page_id: i64 },
    /// Time-based media (video, audio transcripts); offsets in seconds.
    Span { chunk_id: i64, start: f64, end: f64 },
}

impl ChunkPosition {
    /// Stable key used to match pipeline output back to its input.
    pub fn key(&self) -> String {
        match self {
            ChunkPosition::Page { page_id } => format!("page:{}", page_id),
            ChunkPosition::Span { chunk_id, .. } => format!("span:{}", chunk_id),
        }
    }
}

/// A unit of text derived from a source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentChunk {
    pub doc_id: String,
    pub user_id: String,
    pub file_type: String,
    #[serde(flatten)]
    pub position: ChunkPosition,
    pub content: String,
}

impl ContentChunk {
    pub fn key(&self) -> String {
        self.position.key()
    }
}

/// Display/expiry window inherited by every record of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub display_date: DateTime<Utc>,
    pub expire_date: DateTime<Utc>,
}

impl ValidityWindow {
    /// Visible from now on, never expires.
    pub fn open_ended() -> Self {
        Self {
            display_date: Utc::now(),
            expire_date: DateTime::<Utc>::MAX_UTC,
        }
    }
}

/// A content chunk plus its embedding, ready for the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedRecord {
    pub chunk: ContentChunk,
    pub vector: Vec<f32>,
    pub window: ValidityWindow,
}

impl EmbeddedRecord {
    pub fn key(&self) -> String {
        self.chunk.key()
    }
}

/// Convert a timestamp to the integer epoch seconds stored in the index.
pub fn to_epoch(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

/// Inverse of [`to_epoch`]; out-of-range values clamp to the chrono limits.
pub fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(if secs < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}
