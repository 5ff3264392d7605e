//! Per-collection layout inside an attached database
//!
//! Tables live in a secondary database file that the primary connection
//! has attached under an alias, so every reference reads `alias.table`.
//! Indexes are not created through the alias. Instead the secondary file
//! is pre-initialized on its own connection before it is attached, and
//! [`SchemaStrategy::initialize_schema`] only checks the catalog and
//! warns about indexes that are missing.

use std::path::Path;

use tracing::{info, warn};

use super::catalog::index_exists;
use super::collection_table::CollectionTableStrategy;
use super::naming::validate_alias;
use super::{SchemaOptions, SchemaStrategy};
use crate::connection::{Connection, SqliteConnection};
use crate::error::StorageResult;
use crate::inventory::{Inventory, InventoryChange, InventoryOperation};
use crate::record::{Record, RecordType, WriteBatch};

/// An expected index absent from the attached file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingIndex {
    pub table: String,
    pub index: String,
    pub expression: String,
}

/// Per-collection tables addressed through an attachment alias
#[derive(Debug)]
pub struct AttachedCollectionTableStrategy {
    alias: String,
    inner: CollectionTableStrategy,
}

impl AttachedCollectionTableStrategy {
    pub fn new(alias: &str, options: SchemaOptions) -> StorageResult<Self> {
        validate_alias(alias)?;
        Ok(Self {
            alias: alias.to_string(),
            inner: CollectionTableStrategy::in_schema(alias, options),
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Create tables and indexes in the secondary file itself
    ///
    /// `conn` must be opened directly on the file, not through the alias.
    pub fn pre_initialize(&self, conn: &dyn Connection) -> StorageResult<()> {
        let direct = CollectionTableStrategy::new(self.inner.options().clone());
        direct.initialize_schema(conn)?;
        direct.create_configured_collections(conn)?;
        Ok(())
    }

    /// Open `path` on its own connection and pre-initialize it
    pub fn pre_initialize_file(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        let path = path.as_ref();
        let mut conn = SqliteConnection::open(path)?;
        self.pre_initialize(&conn)?;
        conn.disconnect()?;
        info!("Pre-initialized {} for alias '{}'", path.display(), self.alias);
        Ok(())
    }

    /// Expected indexes that the attached file's catalog does not list
    pub fn verify_indexes(&self, conn: &dyn Connection) -> StorageResult<Vec<MissingIndex>> {
        let mut missing = Vec::new();
        for spec in self.inner.expected_indexes()? {
            if !index_exists(conn, Some(&self.alias), &spec.name)? {
                missing.push(MissingIndex {
                    table: spec.table,
                    index: spec.name,
                    expression: spec.expression,
                });
            }
        }
        Ok(missing)
    }
}

impl SchemaStrategy for AttachedCollectionTableStrategy {
    fn initialize_schema(&self, conn: &dyn Connection) -> StorageResult<()> {
        self.inner.initialize_schema(conn)?;

        let missing = self.verify_indexes(conn)?;
        for index in &missing {
            warn!(
                "Index {} on {}.{} ({}) is missing; pre-initialize the attached file to create it",
                index.index, self.alias, index.table, index.expression
            );
        }
        if !missing.is_empty() {
            warn!(
                "Attached database '{}' is missing {} index(es)",
                self.alias,
                missing.len()
            );
        }
        Ok(())
    }

    fn table_name(&self, collection: &str) -> String {
        self.inner.table_name(collection)
    }

    fn write_records(&self, conn: &dyn Connection, batch: &WriteBatch) -> StorageResult<()> {
        self.inner.write_records(conn, batch)
    }

    fn read_record(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
        id: &str,
    ) -> StorageResult<Option<Record>> {
        self.inner.read_record(conn, record_type, collection, id)
    }

    fn read_records_bulk(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
        ids: &[String],
    ) -> StorageResult<Vec<Record>> {
        self.inner.read_records_bulk(conn, record_type, collection, ids)
    }

    fn read_all_records(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
    ) -> StorageResult<Vec<Record>> {
        self.inner.read_all_records(conn, record_type, collection)
    }

    fn delete_record(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
        id: &str,
    ) -> StorageResult<()> {
        self.inner.delete_record(conn, record_type, collection, id)
    }

    fn update_inventory_item(
        &self,
        conn: &dyn Connection,
        change: &InventoryChange<'_>,
        operation: InventoryOperation,
    ) -> StorageResult<()> {
        self.inner.update_inventory_item(conn, change, operation)
    }

    fn read_inventory(&self, conn: &dyn Connection) -> StorageResult<Inventory> {
        self.inner.read_inventory(conn)
    }

    fn initialize_inventory(&self, conn: &dyn Connection) -> StorageResult<Inventory> {
        self.inner.initialize_inventory(conn)
    }

    fn delete_all_tables(&self, conn: &dyn Connection) -> StorageResult<()> {
        self.inner.delete_all_tables(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::text;
    use crate::schema::catalog::{list_tables, table_exists};
    use crate::schema::collection_table::{INVENTORY_DOC_ID_INDEX, INVENTORY_TABLE, META_TABLE};
    use serde_json::json;
    use tempfile::TempDir;

    fn options() -> SchemaOptions {
        SchemaOptions::new().with_indexes("users", ["email"])
    }

    fn attach(conn: &SqliteConnection, path: &Path, alias: &str) {
        conn.execute(
            &format!("ATTACH DATABASE ? AS {}", alias),
            &[text(&path.to_string_lossy())],
        )
        .unwrap();
    }

    fn detach(conn: &SqliteConnection, alias: &str) {
        conn.execute_batch(&format!("DETACH DATABASE {}", alias)).unwrap();
    }

    #[test]
    fn test_rejects_bad_alias() {
        assert!(AttachedCollectionTableStrategy::new("main", options()).is_err());
        assert!(AttachedCollectionTableStrategy::new("a.b", options()).is_err());
    }

    #[test]
    fn test_missing_indexes_are_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let secondary = dir.path().join("aux.db");
        std::fs::File::create(&secondary).unwrap();

        let conn = SqliteConnection::open_in_memory().unwrap();
        attach(&conn, &secondary, "aux");

        let strategy = AttachedCollectionTableStrategy::new("aux", options()).unwrap();
        strategy.initialize_schema(&conn).unwrap();

        let missing = strategy.verify_indexes(&conn).unwrap();
        let names: Vec<&str> = missing.iter().map(|m| m.index.as_str()).collect();
        assert_eq!(names, vec![INVENTORY_DOC_ID_INDEX, "idx_coll_users_email"]);

        // System tables still went into the attached file, not main
        assert!(table_exists(&conn, Some("aux"), META_TABLE).unwrap());
        assert!(table_exists(&conn, Some("aux"), INVENTORY_TABLE).unwrap());
        assert!(list_tables(&conn, None).unwrap().is_empty());
    }

    #[test]
    fn test_pre_initialize_then_attach() {
        let dir = TempDir::new().unwrap();
        let secondary = dir.path().join("aux.db");

        let strategy = AttachedCollectionTableStrategy::new("aux", options()).unwrap();
        strategy.pre_initialize_file(&secondary).unwrap();

        let conn = SqliteConnection::open_in_memory().unwrap();
        attach(&conn, &secondary, "aux");
        strategy.initialize_schema(&conn).unwrap();
        assert!(strategy.verify_indexes(&conn).unwrap().is_empty());
        assert!(table_exists(&conn, Some("aux"), "coll_users").unwrap());

        let user = Record::from_value(
            "users/u1",
            json!({"collection": "users", "id": "u1", "email": "a@b.c", "v": 1}),
        )
        .unwrap();
        strategy
            .write_records(&conn, &WriteBatch::docs(vec![user.clone()]))
            .unwrap();
        assert_eq!(
            strategy
                .read_record(&conn, RecordType::Docs, None, "users/u1")
                .unwrap(),
            Some(user)
        );

        // The row landed in the secondary file
        detach(&conn, "aux");
        let direct = SqliteConnection::open(&secondary).unwrap();
        let row = direct
            .query_one("SELECT id FROM coll_users", &[])
            .unwrap()
            .unwrap();
        assert_eq!(row.text("id").unwrap(), "users/u1");
    }

    #[test]
    fn test_delete_all_tables_only_touches_alias() {
        let dir = TempDir::new().unwrap();
        let secondary = dir.path().join("aux.db");
        let strategy = AttachedCollectionTableStrategy::new("aux", options()).unwrap();
        strategy.pre_initialize_file(&secondary).unwrap();

        let conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE coll_local (id TEXT)").unwrap();
        attach(&conn, &secondary, "aux");
        strategy.initialize_schema(&conn).unwrap();

        strategy.delete_all_tables(&conn).unwrap();
        assert!(list_tables(&conn, Some("aux")).unwrap().is_empty());
        assert_eq!(list_tables(&conn, None).unwrap(), vec!["coll_local"]);
    }
}
