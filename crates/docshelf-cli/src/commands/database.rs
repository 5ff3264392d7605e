//! Database lifecycle command handlers

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use docshelf_core::{AsyncStore, Config, Store};

use crate::output::{Output, OutputFormat};

/// Write a default config file when none exists and create the schema
pub async fn init(store: &AsyncStore, config: &Config, config_path: &Path, output: &Output) -> Result<()> {
    if !config_path.exists() {
        config
            .save_to_path(config_path)
            .context("Failed to write configuration")?;
        output.message(&format!("Wrote {}", config_path.display()));
    }

    let inventory = store.inventory().await?;
    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "database": config.database_path(),
                    "strategy": config.schema.strategy.to_string(),
                    "documents": inventory.len(),
                })
            );
        }
        OutputFormat::Quiet => {}
        OutputFormat::Human => {
            println!("Database: {}", config.database_path().display());
            println!("Layout:   {}", config.schema.strategy);
            println!("Tracked:  {} document(s)", inventory.len());
        }
    }
    Ok(())
}

/// List tables of the primary database and its attachments
pub async fn tables(store: &AsyncStore, output: &Output) -> Result<()> {
    let tables = store.tables().await?;
    output.print_tables(&tables);
    Ok(())
}

/// Create tables and indexes in a secondary file before attaching it
pub fn preinit(config: &Config, path: PathBuf, output: &Output) -> Result<()> {
    Store::preinitialize(config, &path)?;
    output.success(&format!("Pre-initialized {}", path.display()));
    Ok(())
}

/// Drop every table the configured layout created
pub async fn drop_tables(store: &AsyncStore, yes: bool, output: &Output) -> Result<()> {
    if !yes && output.should_prompt() && !confirm("Drop all docshelf tables?")? {
        println!("Cancelled.");
        return Ok(());
    }

    store.delete_database().await?;
    output.success("Dropped all tables");
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(matches!(input.trim().to_lowercase().as_str(), "y" | "yes"))
}
