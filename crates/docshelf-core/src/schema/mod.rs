//! Schema strategies
//!
//! A schema strategy decides how records map onto tables: where
//! documents live, how the inventory is stored, which indexes and
//! projections exist, and how payloads are encrypted on the way in.
//!
//! ## Variants
//!
//! - [`SingleTableStrategy`] - every document in one `docs` table,
//!   inventory as a single JSON document
//! - [`CollectionTableStrategy`] - one table per collection, inventory
//!   as an indexed table
//! - [`AttachedCollectionTableStrategy`] - the per-collection layout
//!   inside an attached database file, addressed through its alias
//!
//! [`Strategy`] is the closed set of these variants and is what the
//! store holds.

pub mod attached;
pub mod catalog;
pub mod collection_table;
pub mod naming;
pub mod projection;
pub mod single_table;

pub use attached::{AttachedCollectionTableStrategy, MissingIndex};
pub use collection_table::CollectionTableStrategy;
pub use projection::ProjectionConfig;
pub use single_table::{SingleTableStrategy, TableMapper};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::connection::{Connection, Row};
use crate::encryption::{Encryption, SealedPayload};
use crate::error::{StorageError, StorageResult};
use crate::inventory::{Inventory, InventoryChange, InventoryOperation};
use crate::record::{Record, RecordType, WriteBatch};

/// Upper bound of bound parameters per `IN (...)` query
pub(crate) const MAX_BATCH_PARAMS: usize = 500;

/// Per-collection schema settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    /// Field paths to index (`email`, `profile.name`)
    #[serde(default)]
    pub indexes: Vec<String>,
    /// Fields encrypted individually when encryption is configured
    #[serde(default)]
    pub encrypted_fields: Vec<String>,
}

/// Everything a strategy needs beyond its own layout choices
#[derive(Debug, Clone, Default)]
pub struct SchemaOptions {
    pub collections: BTreeMap<String, CollectionSchema>,
    pub projections: Vec<ProjectionConfig>,
    pub encryption: Option<Encryption>,
}

impl SchemaOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_indexes<I, S>(mut self, collection: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .indexes
            .extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn with_projection(mut self, projection: ProjectionConfig) -> Self {
        self.projections.push(projection);
        self
    }

    pub fn with_encryption(mut self, encryption: Encryption) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Index paths configured for a collection
    pub fn indexes(&self, collection: &str) -> &[String] {
        self.collections
            .get(collection)
            .map(|c| c.indexes.as_slice())
            .unwrap_or_default()
    }

    /// Projections fed by a collection
    pub fn projections_for<'a>(&'a self, collection: &'a str) -> impl Iterator<Item = &'a ProjectionConfig> + 'a {
        self.projections
            .iter()
            .filter(move |p| p.collection == collection)
    }

    /// Check every index path and projection before any DDL runs
    pub fn validate(&self) -> StorageResult<()> {
        for schema in self.collections.values() {
            for field in &schema.indexes {
                naming::json_path(field)?;
            }
        }
        for projection in &self.projections {
            projection.validate()?;
        }
        Ok(())
    }

    pub(crate) fn seal(&self, collection: Option<&str>, payload: &Map<String, Value>) -> StorageResult<String> {
        let sealed = SealedPayload::seal(self.encryption.as_ref(), collection, payload)?;
        Ok(sealed.to_json().to_string())
    }

    /// Decode an `(id, data)` row into a record, decrypting as needed
    pub(crate) fn decode(&self, row: &Row) -> StorageResult<Record> {
        let id = row.text("id")?;
        let data: Value = serde_json::from_str(&row.text("data")?)?;
        let payload = SealedPayload::from_json(data)?.open(self.encryption.as_ref())?;
        Ok(Record::new(id, payload))
    }
}

/// Which layout to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    SingleTable,
    #[default]
    CollectionTable,
    AttachedCollectionTable,
}

impl FromStr for StrategyKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_table" => Ok(StrategyKind::SingleTable),
            "collection_table" => Ok(StrategyKind::CollectionTable),
            "attached_collection_table" => Ok(StrategyKind::AttachedCollectionTable),
            other => Err(StorageError::validation(format!(
                "unknown schema strategy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::SingleTable => "single_table",
            StrategyKind::CollectionTable => "collection_table",
            StrategyKind::AttachedCollectionTable => "attached_collection_table",
        };
        f.write_str(name)
    }
}

/// Capability set shared by every layout
pub trait SchemaStrategy {
    /// Create every table and index this strategy owns; safe to repeat
    fn initialize_schema(&self, conn: &dyn Connection) -> StorageResult<()>;

    /// Physical table (unqualified) backing a collection
    fn table_name(&self, collection: &str) -> String;

    /// Write docs and meta records and update the inventory, atomically
    fn write_records(&self, conn: &dyn Connection, batch: &WriteBatch) -> StorageResult<()>;

    /// Read one record; an unknown collection is resolved via the inventory
    fn read_record(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
        id: &str,
    ) -> StorageResult<Option<Record>>;

    /// Read many records; missing ids are left out of the result
    fn read_records_bulk(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
        ids: &[String],
    ) -> StorageResult<Vec<Record>>;

    /// Every record of a collection (or of all collections)
    fn read_all_records(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
    ) -> StorageResult<Vec<Record>>;

    /// Delete a record with its inventory entry and projection rows
    fn delete_record(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
        id: &str,
    ) -> StorageResult<()>;

    /// Apply an inventory operation after checking both invariants
    fn update_inventory_item(
        &self,
        conn: &dyn Connection,
        change: &InventoryChange<'_>,
        operation: InventoryOperation,
    ) -> StorageResult<()>;

    fn read_inventory(&self, conn: &dyn Connection) -> StorageResult<Inventory>;

    /// Make sure an inventory exists and return it
    fn initialize_inventory(&self, conn: &dyn Connection) -> StorageResult<Inventory>;

    /// Drop every table this strategy created
    fn delete_all_tables(&self, conn: &dyn Connection) -> StorageResult<()>;
}

/// The closed set of layouts
pub enum Strategy {
    SingleTable(SingleTableStrategy),
    CollectionTable(CollectionTableStrategy),
    Attached(AttachedCollectionTableStrategy),
}

impl Strategy {
    /// Build a strategy of `kind`
    ///
    /// `table_prefix` only applies to the single-table layout; `alias` is
    /// required by the attached layout.
    pub fn build(
        kind: StrategyKind,
        options: SchemaOptions,
        table_prefix: &str,
        alias: Option<&str>,
    ) -> StorageResult<Self> {
        options.validate()?;
        match kind {
            StrategyKind::SingleTable => Ok(Strategy::SingleTable(
                SingleTableStrategy::new(options).with_prefix(table_prefix),
            )),
            StrategyKind::CollectionTable => {
                Ok(Strategy::CollectionTable(CollectionTableStrategy::new(options)))
            }
            StrategyKind::AttachedCollectionTable => {
                let alias = alias.ok_or_else(|| {
                    StorageError::validation("attached strategy requires an attachment alias")
                })?;
                Ok(Strategy::Attached(AttachedCollectionTableStrategy::new(
                    alias, options,
                )?))
            }
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::SingleTable(_) => StrategyKind::SingleTable,
            Strategy::CollectionTable(_) => StrategyKind::CollectionTable,
            Strategy::Attached(_) => StrategyKind::AttachedCollectionTable,
        }
    }

    /// The attached variant, when this is one
    pub fn as_attached(&self) -> Option<&AttachedCollectionTableStrategy> {
        match self {
            Strategy::Attached(s) => Some(s),
            _ => None,
        }
    }

    fn inner(&self) -> &dyn SchemaStrategy {
        match self {
            Strategy::SingleTable(s) => s,
            Strategy::CollectionTable(s) => s,
            Strategy::Attached(s) => s,
        }
    }
}

impl SchemaStrategy for Strategy {
    fn initialize_schema(&self, conn: &dyn Connection) -> StorageResult<()> {
        self.inner().initialize_schema(conn)
    }

    fn table_name(&self, collection: &str) -> String {
        self.inner().table_name(collection)
    }

    fn write_records(&self, conn: &dyn Connection, batch: &WriteBatch) -> StorageResult<()> {
        self.inner().write_records(conn, batch)
    }

    fn read_record(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
        id: &str,
    ) -> StorageResult<Option<Record>> {
        self.inner().read_record(conn, record_type, collection, id)
    }

    fn read_records_bulk(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
        ids: &[String],
    ) -> StorageResult<Vec<Record>> {
        self.inner()
            .read_records_bulk(conn, record_type, collection, ids)
    }

    fn read_all_records(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
    ) -> StorageResult<Vec<Record>> {
        self.inner().read_all_records(conn, record_type, collection)
    }

    fn delete_record(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
        id: &str,
    ) -> StorageResult<()> {
        self.inner().delete_record(conn, record_type, collection, id)
    }

    fn update_inventory_item(
        &self,
        conn: &dyn Connection,
        change: &InventoryChange<'_>,
        operation: InventoryOperation,
    ) -> StorageResult<()> {
        self.inner().update_inventory_item(conn, change, operation)
    }

    fn read_inventory(&self, conn: &dyn Connection) -> StorageResult<Inventory> {
        self.inner().read_inventory(conn)
    }

    fn initialize_inventory(&self, conn: &dyn Connection) -> StorageResult<Inventory> {
        self.inner().initialize_inventory(conn)
    }

    fn delete_all_tables(&self, conn: &dyn Connection) -> StorageResult<()> {
        self.inner().delete_all_tables(conn)
    }
}

/// `?, ?, ?` for `n` parameters
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Keep the first occurrence of each id, preserving order
pub(crate) fn dedup_ids(ids: &[String]) -> Vec<&str> {
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .map(String::as_str)
        .filter(|id| seen.insert(*id))
        .collect()
}

/// Order fetched records like the requested ids, dropping misses
pub(crate) fn in_request_order(ids: &[&str], mut found: std::collections::HashMap<String, Record>) -> Vec<Record> {
    ids.iter().filter_map(|id| found.remove(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SqliteConnection;
    use serde_json::json;

    #[test]
    fn test_strategy_kind_parsing() {
        assert_eq!(
            "single_table".parse::<StrategyKind>().unwrap(),
            StrategyKind::SingleTable
        );
        assert_eq!(
            StrategyKind::AttachedCollectionTable.to_string(),
            "attached_collection_table"
        );
        assert!("sharded".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_build_validates_options() {
        let options = SchemaOptions::new().with_indexes("users", ["bad path!"]);
        assert!(Strategy::build(StrategyKind::CollectionTable, options, "", None).is_err());

        let err = Strategy::build(StrategyKind::AttachedCollectionTable, SchemaOptions::new(), "", None);
        assert!(matches!(err, Err(StorageError::Validation(_))));
    }

    #[test]
    fn test_enum_dispatch() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        for kind in [StrategyKind::SingleTable, StrategyKind::CollectionTable] {
            let strategy = Strategy::build(kind, SchemaOptions::new(), "", None).unwrap();
            assert_eq!(strategy.kind(), kind);
            strategy.initialize_schema(&conn).unwrap();

            let record = Record::from_value(
                "posts/p1",
                json!({"collection": "posts", "id": "p1", "v": 1}),
            )
            .unwrap();
            strategy
                .write_records(&conn, &WriteBatch::docs(vec![record.clone()]))
                .unwrap();
            let read = strategy
                .read_record(&conn, RecordType::Docs, None, "posts/p1")
                .unwrap();
            assert_eq!(read, Some(record));

            strategy.delete_all_tables(&conn).unwrap();
        }
    }

    #[test]
    fn test_helpers() {
        assert_eq!(placeholders(3), "?, ?, ?");
        let ids = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(dedup_ids(&ids), vec!["a", "b"]);
    }
}
