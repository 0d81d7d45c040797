//! Schema metadata inspection tool.
//!
//! Opens a SQLite database, reads its catalog through the metacache caches
//! and prints the requested objects as JSON.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use metacache_core::dialects::sqlite::{SqliteCatalog, SqliteSchema, SqliteSession};
use metacache_core::{CacheConfig, logging::init_logging};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "metacache")]
#[command(about = "Schema metadata inspection tool")]
#[command(version)]
#[command(long_about = "
metacache - Lazy schema metadata inspection

Reads tables, columns, indexes and triggers from a database catalog,
querying each kind of object at most once per run.

SUPPORTED DATABASES:
- SQLite (sqlite:// URLs, .db/.sqlite files, or :memory:)

EXAMPLES:
  metacache --database-url sqlite://./app.db tables
  metacache --database-url ./app.db columns users
  metacache --database-url ./app.db snapshot --output schema.json
")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Database connection URL
    #[arg(long, env = "DATABASE_URL", help = "Database connection string")]
    pub database_url: String,

    /// Attached database to inspect
    #[arg(long, default_value = "main", help = "Attached database name (main, temp, ...)")]
    pub schema: String,

    /// Query timeout in seconds
    #[arg(long, default_value = "30", help = "Seconds to wait for a catalog query")]
    pub query_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List tables and views
    Tables,
    /// List the columns of a table
    Columns(TableArgs),
    /// List indexes, of one table or of every table
    Indexes(OptionalTableArgs),
    /// List triggers
    Triggers,
    /// Dump the complete catalog
    Snapshot(SnapshotArgs),
    /// Load the complete catalog and report cache statistics
    Stats,
}

#[derive(Args)]
pub struct TableArgs {
    /// Table name
    pub table: String,
}

#[derive(Args)]
pub struct OptionalTableArgs {
    /// Table name; all tables when omitted
    pub table: Option<String>,
}

#[derive(Args)]
pub struct SnapshotArgs {
    /// Output file path
    #[arg(short, long, help = "Write the snapshot to a file instead of stdout")]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, help = "Suppress all log output except errors")]
    pub quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet)?;

    let session = SqliteSession::connect(&cli.database_url)
        .await
        .map_err(|e| {
            error!("Failed to open database: {}", e);
            e
        })
        .context("Could not open database")?;

    let config = CacheConfig::default()
        .with_case_sensitive(false)
        .with_query_timeout(Duration::from_secs(cli.query_timeout.max(1)));
    let catalog = SqliteCatalog::with_config(SqliteSchema::new(cli.schema.clone()), config)?;

    let outcome = run(&cli.command, &catalog, &session).await;
    session.close().await;
    outcome
}

async fn run(command: &Command, catalog: &SqliteCatalog, session: &SqliteSession) -> Result<()> {
    match command {
        Command::Tables => {
            let tables = catalog.tables().get_objects(session, catalog.schema()).await?;
            info!("Found {} tables and views", tables.len());
            print_json(&tables.iter().map(|t| t.as_ref()).collect::<Vec<_>>())
        }
        Command::Columns(args) => {
            let Some(columns) = catalog.columns(session, &args.table).await? else {
                bail!("Table '{}' not found", args.table);
            };
            print_json(&columns.iter().map(|c| c.as_ref()).collect::<Vec<_>>())
        }
        Command::Indexes(args) => {
            let indexes = match &args.table {
                Some(table) => match catalog.table_indexes(session, table).await? {
                    Some(indexes) => indexes,
                    None => bail!("Table '{}' not found", table),
                },
                None => catalog.indexes().get_objects(session, catalog.schema()).await?,
            };
            info!("Found {} indexes", indexes.len());
            print_json(&indexes.iter().map(|i| i.as_ref()).collect::<Vec<_>>())
        }
        Command::Triggers => {
            let triggers = catalog
                .triggers()
                .get_objects(session, catalog.schema())
                .await?;
            print_json(&triggers.iter().map(|t| t.as_ref()).collect::<Vec<_>>())
        }
        Command::Snapshot(args) => {
            let snapshot = catalog.snapshot(session).await?;
            for warning in &snapshot.warnings {
                tracing::warn!("{}", warning);
            }
            match &args.output {
                Some(path) => {
                    let json = serde_json::to_string_pretty(&snapshot)?;
                    tokio::fs::write(path, json)
                        .await
                        .with_context(|| format!("Failed to write to {}", path.display()))?;
                    info!("Snapshot saved to {}", path.display());
                    println!("Objects: {}", snapshot.object_count());
                    println!("Output: {}", path.display());
                    Ok(())
                }
                None => print_json(&snapshot),
            }
        }
        Command::Stats => {
            catalog.snapshot(session).await?;
            print_json(&catalog.summary())
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("JSON serialization")?;
    println!("{json}");
    Ok(())
}
