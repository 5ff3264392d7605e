//! Unified storage interface
//!
//! The `Store` owns one primary connection and coordinates:
//! - attachments (secondary database files, attached in config order)
//! - the configured schema strategy (where records and inventory live)
//!
//! Framework calls address records by store name: `"meta"` means
//! metadata records, any other name is a collection of documents.
//!
//! ## Usage
//!
//! ```text
//! let store = Store::open(Config::load()?, None)?;
//!
//! store.put("term", "t1", json!({"v": 1, "label": "Rust"}))?;
//! let record = store.find("term/t1")?;
//! ```
//!
//! [`AsyncStore`] exposes the same operations as `async fn`s for callers
//! running on tokio.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing::{debug, info};

use crate::attachment::AttachmentManager;
use crate::config::Config;
use crate::connection::sqlite::MEMORY_PATH;
use crate::connection::{Connection, SqliteConnection};
use crate::encryption::Encryption;
use crate::inventory::{Inventory, InventoryChange, InventoryOperation, Version};
use crate::record::{keys, resolve_store_name, Record, RecordType, WriteBatch};
use crate::schema::catalog::list_tables;
use crate::schema::{AttachedCollectionTableStrategy, SchemaStrategy, Strategy, StrategyKind};

/// Unified storage interface for docshelf
pub struct Store {
    conn: SqliteConnection,
    strategy: Strategy,
    attachments: AttachmentManager,
    config: Config,
}

impl Store {
    /// Open the primary database, attach secondaries and initialize the schema
    ///
    /// When the attached layout's own attachment is missing and may be
    /// created, the new file is pre-initialized (tables and indexes)
    /// before it is attached.
    pub fn open(config: Config, encryption: Option<Encryption>) -> Result<Self> {
        config.validate()?;

        let strategy = Strategy::build(
            config.schema.strategy,
            config.schema_options(encryption),
            &config.schema.table_prefix,
            config.schema.attachment_alias.as_deref(),
        )
        .context("Failed to build schema strategy")?;

        if let Some(attached) = strategy.as_attached() {
            pre_initialize_new_attachment(&config, attached)?;
        }

        let path = config.database_path();
        let mut conn = SqliteConnection::new(path.to_string_lossy().into_owned())
            .with_retry_policy(config.retry_policy());
        conn.connect()
            .with_context(|| format!("Failed to open database: {:?}", path))?;

        let mut attachments = AttachmentManager::new();
        attachments
            .attach_all(&conn, &config.attachments)
            .context("Failed to attach databases")?;

        strategy
            .initialize_schema(&conn)
            .context("Failed to initialize schema")?;
        let inventory = strategy
            .initialize_inventory(&conn)
            .context("Failed to initialize inventory")?;

        info!(
            "Opened {:?} with {} layout ({} tracked documents)",
            path,
            strategy.kind(),
            inventory.len()
        );

        Ok(Self {
            conn,
            strategy,
            attachments,
            config,
        })
    }

    /// Open using the config file and environment
    pub fn open_default() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Self::open(config, None)
    }

    /// Create tables and indexes in a secondary file before it is attached
    ///
    /// Uses the attached layout described by `config` regardless of the
    /// configured strategy kind.
    pub fn preinitialize(config: &Config, path: &Path) -> Result<()> {
        let alias = config
            .schema
            .attachment_alias
            .as_deref()
            .ok_or_else(|| anyhow!("schema.attachment_alias is not configured"))?;
        let strategy = AttachedCollectionTableStrategy::new(alias, config.schema_options(None))?;
        strategy
            .pre_initialize_file(path)
            .with_context(|| format!("Failed to pre-initialize {:?}", path))
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn connection(&self) -> &SqliteConnection {
        &self.conn
    }

    pub fn attachments(&self) -> &AttachmentManager {
        &self.attachments
    }

    /// Whether the configured layout is the attached one
    pub fn is_attached_layout(&self) -> bool {
        self.strategy.kind() == StrategyKind::AttachedCollectionTable
    }

    // ==================== Writes ====================

    /// Write a batch of docs and meta records atomically
    pub fn write(&self, batch: &WriteBatch) -> Result<()> {
        self.strategy
            .write_records(&self.conn, batch)
            .context("Failed to write records")
    }

    /// Write one document under the storage key `collection/id`
    ///
    /// `collection` and `id` are added to the payload when absent.
    pub fn put(&self, collection: &str, id: &str, payload: Value) -> Result<Record> {
        let Value::Object(mut payload) = payload else {
            bail!("Document payload must be a JSON object");
        };
        payload
            .entry(keys::COLLECTION)
            .or_insert_with(|| Value::String(collection.to_string()));
        payload
            .entry(keys::ID)
            .or_insert_with(|| Value::String(id.to_string()));

        let record = Record::new(format!("{}/{}", collection, id), payload);
        self.write(&WriteBatch::docs(vec![record.clone()]))?;
        Ok(record)
    }

    /// Delete a record with its inventory entry and projection rows
    pub fn delete(&self, store_name: &str, id: &str) -> Result<()> {
        let (record_type, collection) = resolve_store_name(store_name);
        self.strategy
            .delete_record(&self.conn, record_type, collection, id)
            .with_context(|| format!("Failed to delete {}/{}", store_name, id))
    }

    // ==================== Reads ====================

    /// Read one record from a store
    pub fn get(&self, store_name: &str, id: &str) -> Result<Option<Record>> {
        let (record_type, collection) = resolve_store_name(store_name);
        self.strategy
            .read_record(&self.conn, record_type, collection, id)
            .with_context(|| format!("Failed to read {}/{}", store_name, id))
    }

    /// Read a document without knowing its collection
    pub fn find(&self, id: &str) -> Result<Option<Record>> {
        self.strategy
            .read_record(&self.conn, RecordType::Docs, None, id)
            .with_context(|| format!("Failed to read document {}", id))
    }

    /// Read many records; ids that do not exist are left out
    pub fn get_many(&self, store_name: &str, ids: &[String]) -> Result<Vec<Record>> {
        let (record_type, collection) = resolve_store_name(store_name);
        self.strategy
            .read_records_bulk(&self.conn, record_type, collection, ids)
            .with_context(|| format!("Failed to read records from {}", store_name))
    }

    /// Every record of a store
    pub fn get_all(&self, store_name: &str) -> Result<Vec<Record>> {
        let (record_type, collection) = resolve_store_name(store_name);
        self.strategy
            .read_all_records(&self.conn, record_type, collection)
            .with_context(|| format!("Failed to read records from {}", store_name))
    }

    // ==================== Inventory ====================

    pub fn update_inventory(
        &self,
        collection: &str,
        doc_id: &str,
        version: &Version,
        operation: InventoryOperation,
    ) -> Result<()> {
        let change = InventoryChange::new(collection, doc_id, version);
        self.strategy
            .update_inventory_item(&self.conn, &change, operation)
            .with_context(|| format!("Failed to update inventory for {}/{}", collection, doc_id))
    }

    pub fn inventory(&self) -> Result<Inventory> {
        self.strategy
            .read_inventory(&self.conn)
            .context("Failed to read inventory")
    }

    // ==================== Maintenance ====================

    /// Tables of the primary database and of every attachment
    ///
    /// Attached tables are reported as `alias.table`.
    pub fn tables(&self) -> Result<Vec<String>> {
        let mut tables = list_tables(&self.conn, None)?;
        for alias in self.attachments.list_aliases() {
            tables.extend(
                list_tables(&self.conn, Some(alias))?
                    .into_iter()
                    .map(|t| format!("{}.{}", alias, t)),
            );
        }
        Ok(tables)
    }

    /// Drop every table the strategy created
    pub fn delete_database(&self) -> Result<()> {
        self.strategy
            .delete_all_tables(&self.conn)
            .context("Failed to delete tables")?;
        info!("Deleted all {} tables", self.strategy.kind());
        Ok(())
    }

    /// Close the primary connection; attachments go with it
    pub fn disconnect(&mut self) -> Result<()> {
        self.conn.disconnect().context("Failed to close database")?;
        self.attachments.clear();
        debug!("Store closed");
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.disconnect()
    }
}

fn pre_initialize_new_attachment(config: &Config, strategy: &AttachedCollectionTableStrategy) -> Result<()> {
    let Some(attachment) = config
        .attachments
        .iter()
        .find(|a| a.alias == strategy.alias())
    else {
        return Ok(());
    };

    let is_memory = attachment.path.as_os_str() == MEMORY_PATH;
    if attachment.create_if_not_exists && !is_memory && !attachment.path.exists() {
        strategy
            .pre_initialize_file(&attachment.path)
            .with_context(|| format!("Failed to pre-initialize {:?}", attachment.path))?;
    }
    Ok(())
}

/// Async handle over a [`Store`]
///
/// Every call runs on tokio's blocking pool; the mutex keeps one
/// operation on the connection at a time.
#[derive(Clone)]
pub struct AsyncStore {
    inner: Arc<Mutex<Store>>,
}

impl AsyncStore {
    pub async fn open(config: Config, encryption: Option<Encryption>) -> Result<Self> {
        let store = tokio::task::spawn_blocking(move || Store::open(config, encryption))
            .await
            .context("Store open task failed")??;
        Ok(Self::from_store(store))
    }

    pub fn from_store(store: Store) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut store = inner
                .lock()
                .map_err(|_| anyhow!("Store lock poisoned by an earlier panic"))?;
            f(&mut *store)
        })
        .await
        .context("Store task failed")?
    }

    pub async fn write(&self, batch: WriteBatch) -> Result<()> {
        self.run(move |store| store.write(&batch)).await
    }

    pub async fn put(&self, collection: String, id: String, payload: Value) -> Result<Record> {
        self.run(move |store| store.put(&collection, &id, payload)).await
    }

    pub async fn get(&self, store_name: String, id: String) -> Result<Option<Record>> {
        self.run(move |store| store.get(&store_name, &id)).await
    }

    pub async fn find(&self, id: String) -> Result<Option<Record>> {
        self.run(move |store| store.find(&id)).await
    }

    pub async fn get_many(&self, store_name: String, ids: Vec<String>) -> Result<Vec<Record>> {
        self.run(move |store| store.get_many(&store_name, &ids)).await
    }

    pub async fn get_all(&self, store_name: String) -> Result<Vec<Record>> {
        self.run(move |store| store.get_all(&store_name)).await
    }

    pub async fn delete(&self, store_name: String, id: String) -> Result<()> {
        self.run(move |store| store.delete(&store_name, &id)).await
    }

    pub async fn update_inventory(
        &self,
        collection: String,
        doc_id: String,
        version: Version,
        operation: InventoryOperation,
    ) -> Result<()> {
        self.run(move |store| store.update_inventory(&collection, &doc_id, &version, operation))
            .await
    }

    pub async fn inventory(&self) -> Result<Inventory> {
        self.run(|store| store.inventory()).await
    }

    pub async fn tables(&self) -> Result<Vec<String>> {
        self.run(|store| store.tables()).await
    }

    pub async fn delete_database(&self) -> Result<()> {
        self.run(|store| store.delete_database()).await
    }

    pub async fn close(&self) -> Result<()> {
        self.run(|store| store.disconnect()).await
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.conn.path())
            .field("strategy", &self.strategy.kind())
            .field("attachments", &self.attachments.list_aliases())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::AttachmentConfig;
    use crate::error::StorageError;
    use crate::schema::catalog::index_exists;
    use serde_json::json;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir, kind: StrategyKind) -> Config {
        let mut config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        config.schema.strategy = kind;
        config
    }

    fn attached_config(dir: &TempDir) -> Config {
        let mut config = config_in(dir, StrategyKind::AttachedCollectionTable);
        config.schema.attachment_alias = Some("aux".to_string());
        config.attachments.push(
            AttachmentConfig::new(dir.path().join("aux.db"), "aux").create_if_not_exists(true),
        );
        config
            .collections
            .entry("users".to_string())
            .or_default()
            .indexes
            .push("email".to_string());
        config
    }

    #[test]
    fn test_put_get_find_every_layout() {
        for kind in [
            StrategyKind::SingleTable,
            StrategyKind::CollectionTable,
            StrategyKind::AttachedCollectionTable,
        ] {
            let dir = TempDir::new().unwrap();
            let config = match kind {
                StrategyKind::AttachedCollectionTable => attached_config(&dir),
                _ => config_in(&dir, kind),
            };
            let store = Store::open(config, None).unwrap();

            let record = store.put("term", "t1", json!({"v": 1, "label": "Rust"})).unwrap();
            assert_eq!(record.id, "term/t1");
            assert_eq!(record.payload["collection"], json!("term"));

            assert_eq!(store.get("term", "term/t1").unwrap(), Some(record.clone()));
            assert_eq!(store.find("term/t1").unwrap(), Some(record.clone()));
            assert_eq!(
                store.inventory().unwrap().get("term", "t1").unwrap().version,
                Version::Number(1.0)
            );

            store.delete("term", "term/t1").unwrap();
            assert!(store.find("term/t1").unwrap().is_none());
            assert!(store.inventory().unwrap().is_empty());
            store.close().unwrap();
        }
    }

    #[test]
    fn test_meta_store_name() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config_in(&dir, StrategyKind::CollectionTable), None).unwrap();

        let meta = Record::from_value("cursor", json!({"seq": 3})).unwrap();
        store.write(&WriteBatch::meta(vec![meta.clone()])).unwrap();
        assert_eq!(store.get("meta", "cursor").unwrap(), Some(meta.clone()));
        assert_eq!(store.get_all("meta").unwrap(), vec![meta]);
        assert!(store.get_all("term").unwrap().is_empty());
    }

    #[test]
    fn test_put_rejects_non_object() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config_in(&dir, StrategyKind::CollectionTable), None).unwrap();
        assert!(store.put("term", "t1", json!([1, 2])).is_err());
    }

    #[test]
    fn test_regression_error_is_typed() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config_in(&dir, StrategyKind::SingleTable), None).unwrap();

        store
            .update_inventory("posts", "p1", &Version::Number(5.0), InventoryOperation::Add)
            .unwrap();
        let err = store
            .update_inventory("posts", "p1", &Version::Number(3.0), InventoryOperation::Update)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::VersionRegression { .. })
        ));
    }

    #[test]
    fn test_new_attachment_is_pre_initialized() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(attached_config(&dir), None).unwrap();

        assert!(store.is_attached_layout());
        assert_eq!(store.attachments().list_aliases(), vec!["aux"]);
        assert!(index_exists(store.connection(), Some("aux"), "idx_coll_users_email").unwrap());
        let tables = store.tables().unwrap();
        assert!(tables.contains(&"aux.coll_users".to_string()));
        assert!(tables.contains(&"aux.sharedb_inventory".to_string()));
    }

    #[test]
    fn test_preinitialize_requires_alias() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, StrategyKind::CollectionTable);
        assert!(Store::preinitialize(&config, &dir.path().join("x.db")).is_err());

        let config = attached_config(&dir);
        Store::preinitialize(&config, &dir.path().join("x.db")).unwrap();
        assert!(dir.path().join("x.db").exists());
    }

    #[test]
    fn test_delete_database_and_reopen() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, StrategyKind::CollectionTable);
        let store = Store::open(config.clone(), None).unwrap();
        store.put("a", "1", json!({"v": 1})).unwrap();
        store.put("b", "1", json!({"v": 1})).unwrap();

        store.delete_database().unwrap();
        assert!(store.tables().unwrap().is_empty());
        store.close().unwrap();

        let store = Store::open(config, None).unwrap();
        assert!(store.inventory().unwrap().is_empty());
        assert!(store.find("a/1").unwrap().is_none());
    }

    #[test]
    fn test_disconnect_clears_attachments() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(attached_config(&dir), None).unwrap();
        store.disconnect().unwrap();
        assert!(store.attachments().list_aliases().is_empty());
        assert!(!store.connection().is_connected());

        let err = store.get("users", "u1").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_async_store() {
        let dir = TempDir::new().unwrap();
        let store = AsyncStore::open(config_in(&dir, StrategyKind::CollectionTable), None)
            .await
            .unwrap();

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .put("term".to_string(), format!("t{}", i), json!({"v": i}))
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let ids: Vec<String> = (0..5).map(|i| format!("term/t{}", i)).collect();
        let found = store.get_many("term".to_string(), ids).await.unwrap();
        assert_eq!(found.len(), 4);
        assert_eq!(store.inventory().await.unwrap().len(), 4);

        store
            .update_inventory("term".to_string(), "t0".to_string(), Version::Number(9.0), InventoryOperation::Update)
            .await
            .unwrap();
        store.delete("term".to_string(), "term/t1".to_string()).await.unwrap();
        assert!(store.find("term/t1".to_string()).await.unwrap().is_none());
        assert!(store.get("term".to_string(), "term/t0".to_string()).await.unwrap().is_some());

        store.close().await.unwrap();
    }
}
