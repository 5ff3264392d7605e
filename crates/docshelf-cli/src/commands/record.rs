//! Record command handlers

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

use docshelf_core::AsyncStore;

use crate::output::Output;

/// Write one document to a collection
pub async fn put(
    store: &AsyncStore,
    collection: String,
    id: String,
    payload: String,
    output: &Output,
) -> Result<()> {
    let payload: Value =
        serde_json::from_str(&payload).context("Document must be valid JSON")?;

    let record = store
        .put(collection, id, payload)
        .await
        .context("Failed to write document")?;

    output.success(&format!("Stored {}", record.id));
    output.print_record(&record);
    Ok(())
}

/// Show a record from a store
pub async fn get(store: &AsyncStore, store_name: String, id: String, output: &Output) -> Result<()> {
    let record = store
        .get(store_name.clone(), id.clone())
        .await?
        .ok_or_else(|| anyhow!("Record not found: {}/{}", store_name, id))?;

    output.print_record(&record);
    Ok(())
}

/// Delete a record from a store
pub async fn delete(store: &AsyncStore, store_name: String, id: String, output: &Output) -> Result<()> {
    store
        .delete(store_name.clone(), id.clone())
        .await
        .context("Failed to delete record")?;

    output.success(&format!("Deleted {}/{}", store_name, id));
    Ok(())
}
