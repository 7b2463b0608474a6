//! # Tenant Vault Core
//!
//! Storage-agnostic logic for tenant-vault: tenant scopes, content chunks,
//! embedded records, the [`Embedder`](embedding::Embedder) trait, and the
//! migration dependency graph.
//!
//! This crate contains no tokio, sqlx, lancedb, or filesystem I/O. Anything
//! that touches a store lives in the `tenant-vault` app crate.

pub mod embedding;
pub mod migration;
pub mod models;
