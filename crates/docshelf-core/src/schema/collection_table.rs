//! Per-collection table layout
//!
//! Each collection gets its own `coll_<name>` table, created the first
//! time a document of that collection is written. The inventory is a
//! regular table keyed by `(collection, doc_id)` with a secondary index
//! on `doc_id` so a document can be located without knowing its
//! collection.
//!
//! The same code serves the attached layout: every table reference is
//! qualified with the schema name, and index creation can be switched
//! off for schemas where it has to happen out of band.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};

use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use tracing::debug;

use super::catalog::{drop_tables, list_tables_with_prefix, table_exists};
use super::naming::{
    collection_table, index_name, json_path, projection_table, qualify, COLLECTION_TABLE_PREFIX,
    INVENTORY_COLLECTION, META_COLLECTION, PROJECTION_TABLE_PREFIX,
};
use super::{dedup_ids, in_request_order, placeholders, SchemaOptions, SchemaStrategy, MAX_BATCH_PARAMS};
use crate::connection::{quote_ident, text, with_transaction, Connection, Row};
use crate::encryption::check_reserved_keys;
use crate::error::{is_missing_table, StorageError, StorageResult};
use crate::inventory::{
    check_transition, Inventory, InventoryChange, InventoryEntry, InventoryOperation, Version,
};
use crate::record::{split_compound_id, unqualified_id, Record, RecordType, WriteBatch};

/// Metadata records
pub const META_TABLE: &str = "sharedb_meta";
/// Inventory rows
pub const INVENTORY_TABLE: &str = "sharedb_inventory";
/// Reverse lookup index of the inventory
pub const INVENTORY_DOC_ID_INDEX: &str = "idx_sharedb_inventory_doc_id";

/// An index this layout expects to exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub table: String,
    pub name: String,
    /// Indexed expression, e.g. `json_extract(data, '$.email')`
    pub expression: String,
}

/// One table per collection, inventory as an indexed table
#[derive(Debug)]
pub struct CollectionTableStrategy {
    schema: Option<String>,
    options: SchemaOptions,
    create_indexes: bool,
    /// Collection tables known to exist on this connection
    created: RefCell<HashSet<String>>,
}

/// A doc write after validation and encryption
struct PreparedDoc<'a> {
    record: &'a Record,
    collection: &'a str,
    table: String,
    data: String,
    doc_id: String,
    version: Option<Version>,
}

impl CollectionTableStrategy {
    pub fn new(options: SchemaOptions) -> Self {
        Self {
            schema: None,
            options,
            create_indexes: true,
            created: RefCell::new(HashSet::new()),
        }
    }

    /// Address every table through `schema` without creating indexes
    pub(crate) fn in_schema(schema: &str, options: SchemaOptions) -> Self {
        Self {
            schema: Some(schema.to_string()),
            options,
            create_indexes: false,
            created: RefCell::new(HashSet::new()),
        }
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn options(&self) -> &SchemaOptions {
        &self.options
    }

    fn table(&self, name: &str) -> String {
        qualify(self.schema.as_deref(), name)
    }

    /// Every index this layout expects: the inventory reverse lookup plus
    /// each configured collection index
    pub fn expected_indexes(&self) -> StorageResult<Vec<IndexSpec>> {
        let mut specs = vec![IndexSpec {
            table: INVENTORY_TABLE.to_string(),
            name: INVENTORY_DOC_ID_INDEX.to_string(),
            expression: "doc_id".to_string(),
        }];
        for collection in self.options.collections.keys() {
            specs.extend(self.collection_indexes(collection)?);
        }
        Ok(specs)
    }

    fn collection_indexes(&self, collection: &str) -> StorageResult<Vec<IndexSpec>> {
        let table = collection_table(collection);
        self.options
            .indexes(collection)
            .iter()
            .map(|field| {
                Ok(IndexSpec {
                    table: table.clone(),
                    name: index_name(&table, field),
                    expression: format!("json_extract(data, '{}')", json_path(field)?),
                })
            })
            .collect()
    }

    fn index_sql(&self, spec: &IndexSpec) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({});\n",
            qualify(self.schema.as_deref(), &spec.name),
            quote_ident(&spec.table),
            spec.expression
        )
    }

    fn system_ddl(&self) -> String {
        let mut ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {meta} (
                id TEXT PRIMARY KEY,
                data JSON NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {inventory} (
                collection TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                version_num REAL,
                version_str TEXT,
                has_pending INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, doc_id),
                CHECK ((version_num IS NULL) != (version_str IS NULL))
            );
            "#,
            meta = self.table(META_TABLE),
            inventory = self.table(INVENTORY_TABLE)
        );
        if self.create_indexes {
            ddl.push_str(&self.index_sql(&IndexSpec {
                table: INVENTORY_TABLE.to_string(),
                name: INVENTORY_DOC_ID_INDEX.to_string(),
                expression: "doc_id".to_string(),
            }));
        }
        ddl
    }

    fn collection_ddl(&self, collection: &str) -> StorageResult<String> {
        let mut ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                data JSON NOT NULL
            );
            "#,
            self.table(&collection_table(collection))
        );
        if self.create_indexes {
            for spec in self.collection_indexes(collection)? {
                ddl.push_str(&self.index_sql(&spec));
            }
        }
        Ok(ddl)
    }

    /// Create a collection table unless this instance already did
    fn ensure_collection_table(
        &self,
        conn: &dyn Connection,
        collection: &str,
        newly_created: &mut Vec<String>,
    ) -> StorageResult<()> {
        let table = collection_table(collection);
        if self.created.borrow().contains(&table) || newly_created.contains(&table) {
            return Ok(());
        }
        debug!("Creating table {} for collection '{}'", table, collection);
        conn.execute_batch(&self.collection_ddl(collection)?)?;
        newly_created.push(table);
        Ok(())
    }

    /// Create the table of every configured collection up front
    pub(crate) fn create_configured_collections(&self, conn: &dyn Connection) -> StorageResult<()> {
        let mut newly_created = Vec::new();
        for collection in self.options.collections.keys() {
            self.ensure_collection_table(conn, collection, &mut newly_created)?;
        }
        self.created.borrow_mut().extend(newly_created);
        Ok(())
    }

    fn stored_version(
        &self,
        conn: &dyn Connection,
        collection: &str,
        doc_id: &str,
    ) -> StorageResult<Option<Version>> {
        let sql = format!(
            "SELECT version_num, version_str FROM {} WHERE collection = ? AND doc_id = ?",
            self.table(INVENTORY_TABLE)
        );
        conn.query_one(&sql, &[text(collection), text(doc_id)])?
            .map(|row| version_from_row(&row))
            .transpose()
    }

    fn upsert_inventory(&self, conn: &dyn Connection, change: &InventoryChange<'_>) -> StorageResult<()> {
        let entry = InventoryEntry::from_change(change);
        let (num, text_version) = match &entry.version {
            Version::Number(n) => (SqlValue::Real(*n), SqlValue::Null),
            Version::Text(s) => (SqlValue::Null, SqlValue::Text(s.clone())),
        };
        let sql = format!(
            r#"
            INSERT INTO {} (collection, doc_id, version_num, version_str, has_pending, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (collection, doc_id) DO UPDATE SET
                version_num = excluded.version_num,
                version_str = excluded.version_str,
                has_pending = excluded.has_pending,
                updated_at = excluded.updated_at
            "#,
            self.table(INVENTORY_TABLE)
        );
        conn.execute(
            &sql,
            &[
                text(change.collection),
                text(change.doc_id),
                num,
                text_version,
                SqlValue::Integer(i64::from(entry.has_pending_ops)),
                SqlValue::Integer(entry.updated_at),
            ],
        )?;
        Ok(())
    }

    fn delete_inventory(&self, conn: &dyn Connection, collection: &str, doc_id: &str) -> StorageResult<()> {
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE collection = ? AND doc_id = ?",
                self.table(INVENTORY_TABLE)
            ),
            &[text(collection), text(doc_id)],
        )?;
        Ok(())
    }

    /// Work out which collection holds a document whose collection the
    /// caller did not supply
    fn resolve_collection(&self, conn: &dyn Connection, id: &str) -> StorageResult<Option<String>> {
        let compound = split_compound_id(id);
        if let Some((collection, doc_id)) = compound {
            if self.stored_version(conn, collection, doc_id)?.is_some() {
                return Ok(Some(collection.to_string()));
            }
        }

        let sql = format!(
            "SELECT collection FROM {} WHERE doc_id = ? ORDER BY collection LIMIT 1",
            self.table(INVENTORY_TABLE)
        );
        if let Some(row) = conn.query_one(&sql, &[text(id)])? {
            return Ok(Some(row.text("collection")?));
        }

        // Documents written without a version have no inventory entry
        if let Some((collection, _)) = compound {
            if table_exists(conn, self.schema.as_deref(), &collection_table(collection))? {
                return Ok(Some(collection.to_string()));
            }
        }
        Ok(None)
    }

    /// Resolve many ids with one inventory query
    fn resolve_collections<'a>(
        &self,
        conn: &dyn Connection,
        ids: &[&'a str],
    ) -> StorageResult<BTreeMap<String, Vec<&'a str>>> {
        let mut lookup_keys: Vec<&str> = Vec::new();
        for id in ids {
            lookup_keys.push(id);
            if let Some((_, doc_id)) = split_compound_id(id) {
                lookup_keys.push(doc_id);
            }
        }
        lookup_keys.sort_unstable();
        lookup_keys.dedup();

        let mut owners: HashMap<String, Vec<String>> = HashMap::new();
        for chunk in lookup_keys.chunks(MAX_BATCH_PARAMS) {
            let sql = format!(
                "SELECT collection, doc_id FROM {} WHERE doc_id IN ({}) ORDER BY collection",
                self.table(INVENTORY_TABLE),
                placeholders(chunk.len())
            );
            let params: Vec<SqlValue> = chunk.iter().map(|k| text(k)).collect();
            for row in conn.query_all(&sql, &params)? {
                owners
                    .entry(row.text("doc_id")?)
                    .or_default()
                    .push(row.text("collection")?);
            }
        }

        let mut existing_tables: HashMap<String, bool> = HashMap::new();
        let mut groups: BTreeMap<String, Vec<&'a str>> = BTreeMap::new();
        for id in ids {
            let compound = split_compound_id(id);
            let from_compound = compound.and_then(|(collection, doc_id)| {
                owners
                    .get(doc_id)
                    .filter(|cs| cs.iter().any(|c| c == collection))
                    .map(|_| collection.to_string())
            });
            let resolved = match from_compound {
                Some(collection) => Some(collection),
                None => match owners.get(*id).and_then(|cs| cs.first()) {
                    Some(collection) => Some(collection.clone()),
                    None => match compound {
                        Some((collection, _)) => {
                            let exists = match existing_tables.get(collection) {
                                Some(exists) => *exists,
                                None => {
                                    let exists = table_exists(
                                        conn,
                                        self.schema.as_deref(),
                                        &collection_table(collection),
                                    )?;
                                    existing_tables.insert(collection.to_string(), exists);
                                    exists
                                }
                            };
                            exists.then(|| collection.to_string())
                        }
                        None => None,
                    },
                },
            };
            if let Some(collection) = resolved {
                groups.entry(collection).or_default().push(id);
            }
        }
        Ok(groups)
    }

    fn select_by_ids(
        &self,
        conn: &dyn Connection,
        qualified_table: &str,
        ids: &[&str],
        found: &mut HashMap<String, Record>,
    ) -> StorageResult<()> {
        for chunk in ids.chunks(MAX_BATCH_PARAMS) {
            let sql = format!(
                "SELECT id, data FROM {} WHERE id IN ({})",
                qualified_table,
                placeholders(chunk.len())
            );
            let params: Vec<SqlValue> = chunk.iter().map(|id| text(id)).collect();
            for row in missing_table_as_empty(conn.query_all(&sql, &params))? {
                let record = self.options.decode(&row)?;
                found.insert(record.id.clone(), record);
            }
        }
        Ok(())
    }

    fn select_all(&self, conn: &dyn Connection, qualified_table: &str) -> StorageResult<Vec<Record>> {
        let sql = format!("SELECT id, data FROM {} ORDER BY id", qualified_table);
        missing_table_as_empty(conn.query_all(&sql, &[]))?
            .iter()
            .map(|row| self.options.decode(row))
            .collect()
    }

    fn prepare_docs<'a>(&self, docs: &'a [Record]) -> StorageResult<Vec<PreparedDoc<'a>>> {
        docs.iter()
            .map(|record| {
                if record.id.is_empty() {
                    return Err(StorageError::validation("document id must not be empty"));
                }
                let collection = record.require_collection()?;
                Ok(PreparedDoc {
                    record,
                    collection,
                    table: self.table(&collection_table(collection)),
                    data: self.options.seal(Some(collection), &record.payload)?,
                    doc_id: record.doc_id(collection),
                    version: record.version()?,
                })
            })
            .collect()
    }

    /// Check every versioned doc against the stored inventory and against
    /// earlier docs of the same batch
    fn check_versions(&self, conn: &dyn Connection, docs: &[PreparedDoc<'_>]) -> StorageResult<()> {
        let mut accepted: HashMap<(&str, &str), &Version> = HashMap::new();
        for doc in docs {
            let Some(version) = &doc.version else {
                continue;
            };
            let key = (doc.collection, doc.doc_id.as_str());
            let stored = match accepted.get(&key) {
                Some(v) => Some((*v).clone()),
                None => self.stored_version(conn, doc.collection, &doc.doc_id)?,
            };
            check_transition(doc.collection, &doc.doc_id, stored.as_ref(), version)?;
            accepted.insert(key, version);
        }
        Ok(())
    }
}

impl SchemaStrategy for CollectionTableStrategy {
    fn initialize_schema(&self, conn: &dyn Connection) -> StorageResult<()> {
        let mut ddl = self.system_ddl();
        for config in &self.options.projections {
            ddl.push_str(&config.create_table_sql(&self.table(&projection_table(&config.name))));
            ddl.push(';');
        }
        conn.execute_batch(&ddl)
    }

    fn table_name(&self, collection: &str) -> String {
        match collection {
            META_COLLECTION => META_TABLE.to_string(),
            INVENTORY_COLLECTION => INVENTORY_TABLE.to_string(),
            _ => collection_table(collection),
        }
    }

    fn write_records(&self, conn: &dyn Connection, batch: &WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        for record in &batch.meta {
            if record.id.is_empty() {
                return Err(StorageError::validation("meta record id must not be empty"));
            }
            check_reserved_keys(&record.payload)?;
        }
        let docs = self.prepare_docs(&batch.docs)?;

        let mut newly_created = Vec::new();
        with_transaction(conn, "write_records", |c| {
            self.check_versions(c, &docs)?;

            for record in &batch.meta {
                c.execute(
                    &format!(
                        "INSERT OR REPLACE INTO {} (id, data) VALUES (?, ?)",
                        self.table(META_TABLE)
                    ),
                    &[
                        text(&record.id),
                        SqlValue::Text(Value::Object(record.payload.clone()).to_string()),
                    ],
                )?;
            }

            for doc in &docs {
                self.ensure_collection_table(c, doc.collection, &mut newly_created)?;
                c.execute(
                    &format!(
                        "INSERT OR REPLACE INTO {} (id, collection, data) VALUES (?, ?, ?)",
                        doc.table
                    ),
                    &[text(&doc.record.id), text(doc.collection), text(&doc.data)],
                )?;
                if let Some(version) = &doc.version {
                    let change = InventoryChange::new(doc.collection, &doc.doc_id, version)
                        .with_pending_ops(doc.record.has_pending_ops());
                    self.upsert_inventory(c, &change)?;
                }
                for config in self.options.projections_for(doc.collection) {
                    let table = self.table(&projection_table(&config.name));
                    config.rebuild(c, &table, &doc.record.id, &doc.record.payload)?;
                }
            }
            Ok(())
        })?;

        self.created.borrow_mut().extend(newly_created);
        Ok(())
    }

    fn read_record(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
        id: &str,
    ) -> StorageResult<Option<Record>> {
        let table = match record_type {
            RecordType::Meta => self.table(META_TABLE),
            RecordType::Docs => {
                let collection = match collection {
                    Some(c) => c.to_string(),
                    None => match self.resolve_collection(conn, id)? {
                        Some(c) => c,
                        None => return Ok(None),
                    },
                };
                self.table(&collection_table(&collection))
            }
        };

        let sql = format!("SELECT id, data FROM {} WHERE id = ?", table);
        missing_table_as_empty(conn.query_all(&sql, &[text(id)]))?
            .first()
            .map(|row| self.options.decode(row))
            .transpose()
    }

    fn read_records_bulk(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
        ids: &[String],
    ) -> StorageResult<Vec<Record>> {
        let ids = dedup_ids(ids);
        let mut found = HashMap::new();

        match (record_type, collection) {
            (RecordType::Meta, _) => {
                self.select_by_ids(conn, &self.table(META_TABLE), &ids, &mut found)?;
            }
            (RecordType::Docs, Some(collection)) => {
                let table = self.table(&collection_table(collection));
                self.select_by_ids(conn, &table, &ids, &mut found)?;
            }
            (RecordType::Docs, None) => {
                for (collection, group) in self.resolve_collections(conn, &ids)? {
                    let table = self.table(&collection_table(&collection));
                    self.select_by_ids(conn, &table, &group, &mut found)?;
                }
            }
        }
        Ok(in_request_order(&ids, found))
    }

    fn read_all_records(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
    ) -> StorageResult<Vec<Record>> {
        match (record_type, collection) {
            (RecordType::Meta, _) => self.select_all(conn, &self.table(META_TABLE)),
            (RecordType::Docs, Some(collection)) => {
                self.select_all(conn, &self.table(&collection_table(collection)))
            }
            (RecordType::Docs, None) => {
                let mut records = Vec::new();
                let tables =
                    list_tables_with_prefix(conn, self.schema.as_deref(), COLLECTION_TABLE_PREFIX)?;
                for table in tables {
                    records.extend(self.select_all(conn, &self.table(&table))?);
                }
                Ok(records)
            }
        }
    }

    fn delete_record(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        collection: Option<&str>,
        id: &str,
    ) -> StorageResult<()> {
        if record_type == RecordType::Meta {
            conn.execute(
                &format!("DELETE FROM {} WHERE id = ?", self.table(META_TABLE)),
                &[text(id)],
            )?;
            return Ok(());
        }

        let collection = match collection {
            Some(c) => c.to_string(),
            None => match self.resolve_collection(conn, id)? {
                Some(c) => c,
                None => return Ok(()),
            },
        };
        let doc_id = match self.read_record(conn, RecordType::Docs, Some(&collection), id)? {
            Some(record) => record.doc_id(&collection),
            None => unqualified_id(&collection, id).to_string(),
        };
        let table = self.table(&collection_table(&collection));

        with_transaction(conn, "delete_record", |c| {
            missing_table_as_empty(
                c.execute(&format!("DELETE FROM {} WHERE id = ?", table), &[text(id)])
                    .map(|_| ()),
            )?;
            for config in self.options.projections_for(&collection) {
                super::projection::delete_rows(c, &self.table(&projection_table(&config.name)), id)?;
            }
            self.delete_inventory(c, &collection, &doc_id)
        })
    }

    fn update_inventory_item(
        &self,
        conn: &dyn Connection,
        change: &InventoryChange<'_>,
        operation: InventoryOperation,
    ) -> StorageResult<()> {
        with_transaction(conn, "update_inventory_item", |c| match operation {
            InventoryOperation::Remove => self.delete_inventory(c, change.collection, change.doc_id),
            InventoryOperation::Add | InventoryOperation::Update => {
                let stored = self.stored_version(c, change.collection, change.doc_id)?;
                check_transition(change.collection, change.doc_id, stored.as_ref(), change.version)?;
                self.upsert_inventory(c, change)
            }
        })
    }

    fn read_inventory(&self, conn: &dyn Connection) -> StorageResult<Inventory> {
        let sql = format!(
            "SELECT collection, doc_id, version_num, version_str, has_pending, updated_at \
             FROM {} ORDER BY collection, doc_id",
            self.table(INVENTORY_TABLE)
        );
        let mut inventory = Inventory::new();
        for row in conn.query_all(&sql, &[])? {
            let entry = InventoryEntry {
                version: version_from_row(&row)?,
                has_pending_ops: row.opt_integer("has_pending").unwrap_or(0) != 0,
                updated_at: row.opt_integer("updated_at").unwrap_or(0),
            };
            inventory.insert(&row.text("collection")?, &row.text("doc_id")?, entry);
        }
        Ok(inventory)
    }

    fn initialize_inventory(&self, conn: &dyn Connection) -> StorageResult<Inventory> {
        conn.execute_batch(&self.system_ddl())?;
        self.read_inventory(conn)
    }

    fn delete_all_tables(&self, conn: &dyn Connection) -> StorageResult<()> {
        let schema = self.schema.as_deref();
        let mut tables = vec![META_TABLE.to_string(), INVENTORY_TABLE.to_string()];
        tables.extend(list_tables_with_prefix(conn, schema, COLLECTION_TABLE_PREFIX)?);
        tables.extend(list_tables_with_prefix(conn, schema, PROJECTION_TABLE_PREFIX)?);

        drop_tables(conn, schema, &tables)?;
        self.created.borrow_mut().clear();
        Ok(())
    }
}

/// Treat "no such table" as an empty result
fn missing_table_as_empty<T: Default>(result: StorageResult<T>) -> StorageResult<T> {
    match result {
        Err(e) if is_missing_table(&e) => Ok(T::default()),
        other => other,
    }
}

fn version_from_row(row: &Row) -> StorageResult<Version> {
    if let Some(s) = row.opt_text("version_str") {
        return Ok(Version::Text(s));
    }
    row.opt_real("version_num").map(Version::Number).ok_or_else(|| {
        StorageError::validation("inventory row has neither a numeric nor a string version")
    })
}
