//! # Tenant Vault
//!
//! A multi-tenant document backend. Every tenant gets an isolated SQLite
//! store that is created on first use and migrated lazily on every request;
//! document chunks are embedded through an external service and written to
//! per-tenant or shared LanceDB vector tables for retrieval.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐     ┌──────────────────┐
//!  request ──────▶│   registry   │────▶│ migrate (ledger, │
//!  (CLI / HTTP)   │ scope → store│     │  FK-off session) │
//!                 └──────┬───────┘     └──────────────────┘
//!                        │
//!        ┌───────────────┼────────────────┐
//!        ▼               ▼                ▼
//!  ┌──────────┐   ┌────────────┐   ┌───────────────┐
//!  │  ingest  │──▶│   vector   │   │ conversations │
//!  │ fan-out  │   │  (LanceDB) │   │ personas …    │
//!  └──────────┘   └────────────┘   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy with stable codes |
//! | [`logging`] | tracing subscriber setup |
//! | [`registry`] | Scope → tenant store resolution |
//! | [`db`] | Per-request connections with integrity tracking |
//! | [`session`] | Foreign-key-relaxed migration transactions |
//! | [`migrate`] | Migration catalog and coordinator |
//! | [`embedding`] | HTTP embedding clients |
//! | [`ingest`] | Bounded, all-or-nothing embedding fan-out |
//! | [`vector`] | Vector store router, schema, and filters |
//! | [`documents`] | Index, delete, reindex, and search handlers |
//! | [`conversations`], [`personas`], [`activities`] | Tenant records |
//! | [`vault`] | Process-wide handle tying the above together |
//! | [`server`] | HTTP API |

pub mod activities;
pub mod config;
pub mod conversations;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod personas;
pub mod registry;
pub mod server;
pub mod session;
pub mod vault;
pub mod vector;
