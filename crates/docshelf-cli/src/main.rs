//! docshelf CLI
//!
//! Command-line interface for docshelf - inspect and edit a document store.

use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docshelf_core::{AsyncStore, Config, Encryption};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "docshelf")]
#[command(about = "docshelf - SQLite document persistence for offline-first sync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store payloads base64-encoded (whole payload, or the configured encrypted_fields)
    #[arg(long, global = true)]
    obfuscate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema (and a default config file)
    Init,
    /// Write a document
    Put {
        /// Collection name
        collection: String,
        /// Document id within the collection
        id: String,
        /// Document payload as a JSON object
        payload: String,
    },
    /// Show a record ("meta" or a collection name)
    Get {
        /// Store name
        store: String,
        /// Record id (documents use collection/id)
        id: String,
    },
    /// Delete a record
    #[command(alias = "delete")]
    Rm {
        /// Store name
        store: String,
        /// Record id (documents use collection/id)
        id: String,
    },
    /// List tracked documents and their versions
    Inventory,
    /// List tables, including attached databases
    Tables,
    /// Pre-initialize a secondary database file for attachment
    Preinit {
        /// Database file to create or update
        path: PathBuf,
    },
    /// Drop every docshelf table
    Drop {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    init_logging(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(Config::config_file_path);
    let config = Config::load_from_path(&config_path).context("Failed to load configuration")?;

    // Commands that don't need the store
    if let Commands::Preinit { path } = &cli.command {
        return commands::database::preinit(&config, path.clone(), &output);
    }

    let encryption = cli.obfuscate.then(obfuscation);
    let store = AsyncStore::open(config.clone(), encryption).await?;

    let result = match cli.command {
        Commands::Init => commands::database::init(&store, &config, &config_path, &output).await,
        Commands::Put { collection, id, payload } => {
            commands::record::put(&store, collection, id, payload, &output).await
        }
        Commands::Get { store: name, id } => commands::record::get(&store, name, id, &output).await,
        Commands::Rm { store: name, id } => commands::record::delete(&store, name, id, &output).await,
        Commands::Inventory => commands::inventory::list(&store, &output).await,
        Commands::Tables => commands::database::tables(&store, &output).await,
        Commands::Drop { yes } => commands::database::drop_tables(&store, yes, &output).await,
        Commands::Preinit { .. } => unreachable!(), // Handled above
    };

    store.close().await?;
    result
}

/// Initialize stderr logging
///
/// RUST_LOG wins when set; otherwise DOCSHELF_LOG or the -v count picks
/// the level for the docshelf crates.
fn init_logging(verbose: u8) {
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => {
            let level = std::env::var("DOCSHELF_LOG").unwrap_or_else(|_| {
                match verbose {
                    0 => "warn",
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                }
                .to_string()
            });
            EnvFilter::new(format!("docshelf_core={},docshelf={}", level, level))
        }
    };

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Reversible base64 transform for `--obfuscate`
///
/// Not a cipher; it keeps payload text out of casual `sqlite3` dumps.
fn obfuscation() -> Encryption {
    Encryption::new(
        |plain| STANDARD.encode(plain),
        |encoded| {
            STANDARD
                .decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_put() {
        let cli = Cli::try_parse_from(["docshelf", "--json", "put", "term", "t1", r#"{"v":1}"#]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Put { collection, id, payload } => {
                assert_eq!(collection, "term");
                assert_eq!(id, "t1");
                assert_eq!(payload, r#"{"v":1}"#);
            }
            _ => panic!("expected put"),
        }
    }

    #[test]
    fn test_verbose_count() {
        let cli = Cli::try_parse_from(["docshelf", "-vv", "inventory"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Inventory));
    }

    #[test]
    fn test_obfuscation_round_trip() {
        use docshelf_core::{Record, RecordType, SchemaOptions, SchemaStrategy, SqliteConnection, WriteBatch};
        use docshelf_core::CollectionTableStrategy;

        let strategy = CollectionTableStrategy::new(SchemaOptions::new().with_encryption(obfuscation()));
        let conn = SqliteConnection::open_in_memory().unwrap();
        strategy.initialize_schema(&conn).unwrap();

        let record = Record::from_value(
            "term/t1",
            serde_json::json!({"collection": "term", "id": "t1", "v": 1}),
        )
        .unwrap();
        strategy
            .write_records(&conn, &WriteBatch::docs(vec![record.clone()]))
            .unwrap();
        assert_eq!(
            strategy
                .read_record(&conn, RecordType::Docs, Some("term"), "term/t1")
                .unwrap(),
            Some(record)
        );
    }
}
