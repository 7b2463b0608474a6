//! # Tenant Vault CLI (`tvault`)
//!
//! ## Usage
//!
//! ```bash
//! tvault --config ./config/vault.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tvault init --tenant <id>` | Provision a tenant store and apply migrations |
//! | `tvault status --tenant <id>` | Show the migration ledger of a store |
//! | `tvault ingest --tenant <id> <doc.json>` | Embed and index a document |
//! | `tvault search --tenant <id> --table <t> "<query>"` | Similarity search |
//! | `tvault delete --tenant <id> <doc_id>` | Delete a document and its vectors |
//! | `tvault stats --tenant <id> --table <t>` | Row counts of a vector table |
//! | `tvault reindex --tenant <id> --table <t>` | Rebuild a vector table |
//! | `tvault serve` | Start the HTTP server |
//!
//! Every store command takes `--shared` instead of `--tenant` to work on the
//! shared knowledge base.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use tenant_vault::config;
use tenant_vault::documents::{self, IndexRequest, SearchRequest};
use tenant_vault::logging;
use tenant_vault::server;
use tenant_vault::vault::Vault;
use tenant_vault_core::models::Scope;

/// Tenant Vault: per-tenant document stores with embedding-backed retrieval.
#[derive(Parser)]
#[command(name = "tvault", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vault.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Which store a command works on.
#[derive(Args)]
struct ScopeArgs {
    /// Tenant id.
    #[arg(long, conflicts_with = "shared", required_unless_present = "shared")]
    tenant: Option<String>,

    /// The shared knowledge base.
    #[arg(long)]
    shared: bool,
}

impl ScopeArgs {
    fn scope(&self) -> anyhow::Result<Scope> {
        match &self.tenant {
            Some(t) => Ok(Scope::tenant(t)?),
            None => Ok(Scope::Shared),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a store and bring its schema up to date.
    ///
    /// Idempotent: running it again reports that nothing was applied.
    Init {
        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Show applied and missing migrations.
    ///
    /// Read-only: a store that was never provisioned is reported as such and
    /// is not created.
    Status {
        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Embed and index a document described by a JSON file (`-` for stdin).
    Ingest {
        #[command(flatten)]
        scope: ScopeArgs,
        file: PathBuf,
    },

    /// Search a vector table.
    Search {
        #[command(flatten)]
        scope: ScopeArgs,
        query: String,
        #[arg(long)]
        table: String,
        #[arg(long)]
        k: Option<usize>,
        /// Only documents visible right now.
        #[arg(long)]
        current: bool,
    },

    /// Delete a document and its vector rows.
    Delete {
        #[command(flatten)]
        scope: ScopeArgs,
        doc_id: String,
    },

    /// Show relational and vector row counts of a table.
    Stats {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long)]
        table: String,
    },

    /// Re-embed every document of a table and replace its rows.
    Reindex {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long)]
        table: String,
    },

    /// Start the HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging.level);

    let vault = Vault::from_config(&cfg)?;

    match cli.command {
        Commands::Init { scope } => {
            let scope = scope.scope()?;
            let (conn, report) = vault.registry().open(&scope).await?;
            conn.close().await?;
            if report.applied.is_empty() {
                println!("{}: schema is current", scope);
            } else {
                println!("{}: applied {} migration(s)", scope, report.applied.len());
                for id in &report.applied {
                    println!("  {}", id);
                }
            }
        }
        Commands::Status { scope } => {
            let scope = scope.scope()?;
            if !vault.registry().store_exists(&scope) {
                println!("{}: not provisioned (run `tvault init`)", scope);
                return Ok(());
            }
            let store = vault.registry().resolve(&scope).await?;
            let mut conn = store.connect().await?;
            let status = vault.registry().migrator().status(&mut conn).await?;
            conn.close().await?;
            println!("{} ({})", scope, store.db_path().display());
            for id in &status.applied {
                println!("  applied  {}", id);
            }
            for id in &status.missing_leaves {
                println!("  missing  {}", id);
            }
        }
        Commands::Ingest { scope, file } => {
            let scope = scope.scope()?;
            let raw = if file.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin())?
            } else {
                std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?
            };
            let request: IndexRequest =
                serde_json::from_str(&raw).context("Invalid document JSON")?;
            let report = documents::index_document(&vault, &scope, request).await?;
            println!(
                "indexed {} into {} ({} chunks, {} replaced)",
                report.doc_id, report.table, report.chunks, report.replaced
            );
        }
        Commands::Search {
            scope,
            query,
            table,
            k,
            current,
        } => {
            let scope = scope.scope()?;
            let request = SearchRequest {
                table,
                query,
                k,
                filter: None,
                valid_at: current.then(chrono::Utc::now),
            };
            let hits = documents::search(&vault, &scope, &request).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{:.4}] {} {}",
                    i + 1,
                    hit.distance,
                    hit.doc_id,
                    hit.position.key()
                );
                println!("    {}", hit.content.replace('\n', " "));
            }
        }
        Commands::Delete { scope, doc_id } => {
            let scope = scope.scope()?;
            let report = documents::delete_document(&vault, &scope, &doc_id).await?;
            println!(
                "deleted {} ({} chunks, {} vectors)",
                report.doc_id, report.chunks, report.vectors
            );
        }
        Commands::Stats { scope, table } => {
            let scope = scope.scope()?;
            let stats = documents::table_stats(&vault, &scope, &table).await?;
            println!("{} / {}", scope, stats.table);
            match stats.schema {
                Some(schema) => println!("  schema:     {:?}, {} dims", schema.layout, schema.dims),
                None => println!("  schema:     (table not built)"),
            }
            println!("  documents:  {}", stats.documents);
            println!("  chunks:     {}", stats.chunks);
            println!("  vectors:    {} ({} visible now)", stats.vectors, stats.visible);
            if !stats.in_sync {
                println!("  out of sync: run `tvault reindex --table {}`", stats.table);
            }
        }
        Commands::Reindex { scope, table } => {
            let scope = scope.scope()?;
            let report = documents::reindex(&vault, &scope, &table).await?;
            println!(
                "reindexed {}: {} documents, {} chunks ({} rows replaced)",
                report.table, report.documents, report.chunks, report.removed
            );
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
