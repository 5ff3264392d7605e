//! Inventory command handlers

use anyhow::Result;

use docshelf_core::AsyncStore;

use crate::output::Output;

/// List every tracked document and its version
pub async fn list(store: &AsyncStore, output: &Output) -> Result<()> {
    let inventory = store.inventory().await?;
    output.print_inventory(&inventory);
    Ok(())
}
