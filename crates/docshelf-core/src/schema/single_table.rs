//! Single-table layout
//!
//! All documents share one `docs` table; the collection survives only
//! inside the payload. Metadata records live in `meta`, and the whole
//! inventory is one JSON document stored in `meta` under a fixed id. An
//! inventory change reads that document, mutates it and writes it back.
//!
//! Table names can be prefixed (`app_docs`) or produced by a
//! caller-supplied mapping from logical name (`docs`, `meta`,
//! `proj_<name>`) to physical name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use tracing::debug;

use super::catalog::{drop_tables, list_tables_with_prefix};
use super::naming::{qualify, sanitize, PROJECTION_TABLE_PREFIX};
use super::projection::{self, ProjectionConfig};
use super::{dedup_ids, in_request_order, placeholders, SchemaOptions, SchemaStrategy, MAX_BATCH_PARAMS};
use crate::connection::{text, with_transaction, Connection};
use crate::encryption::check_reserved_keys;
use crate::error::{StorageError, StorageResult};
use crate::inventory::{Inventory, InventoryChange, InventoryOperation};
use crate::record::{unqualified_id, Record, RecordType, WriteBatch};

/// Row id of the inventory document inside `meta`
pub const INVENTORY_ROW_ID: &str = "__inventory__";

const DOCS: &str = "docs";
const META: &str = "meta";

/// Maps a logical table name to a physical one
pub type TableMapper = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Every document in one table, inventory as one JSON document
pub struct SingleTableStrategy {
    prefix: String,
    mapper: Option<TableMapper>,
    options: SchemaOptions,
}

impl fmt::Debug for SingleTableStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleTableStrategy")
            .field("prefix", &self.prefix)
            .field("mapped", &self.mapper.is_some())
            .finish_non_exhaustive()
    }
}

impl SingleTableStrategy {
    pub fn new(options: SchemaOptions) -> Self {
        Self {
            prefix: String::new(),
            mapper: None,
            options,
        }
    }

    /// Mount the tables under a name prefix
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = sanitize_prefix(prefix);
        self
    }

    /// Map logical table names through `mapper` instead of prefixing
    pub fn with_table_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.mapper = Some(Arc::new(mapper));
        self
    }

    fn physical(&self, logical: &str) -> String {
        match &self.mapper {
            Some(mapper) => sanitize(&mapper(logical)),
            None => format!("{}{}", self.prefix, logical),
        }
    }

    fn docs_table(&self) -> String {
        qualify(None, &self.physical(DOCS))
    }

    fn meta_table(&self) -> String {
        qualify(None, &self.physical(META))
    }

    fn projection_table(&self, config: &ProjectionConfig) -> String {
        self.physical(&format!("{}{}", PROJECTION_TABLE_PREFIX, sanitize(&config.name)))
    }

    fn save_inventory(&self, conn: &dyn Connection, inventory: &Inventory) -> StorageResult<()> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, data) VALUES (?, ?)",
                self.meta_table()
            ),
            &[text(INVENTORY_ROW_ID), SqlValue::Text(serde_json::to_string(inventory)?)],
        )?;
        Ok(())
    }

    fn read_doc(&self, conn: &dyn Connection, id: &str) -> StorageResult<Option<Record>> {
        let sql = format!("SELECT id, data FROM {} WHERE id = ?", self.docs_table());
        conn.query_one(&sql, &[text(id)])?
            .map(|row| self.options.decode(&row))
            .transpose()
    }

    fn read_meta(&self, conn: &dyn Connection, id: &str) -> StorageResult<Option<Record>> {
        if id == INVENTORY_ROW_ID {
            return Ok(None);
        }
        let sql = format!("SELECT id, data FROM {} WHERE id = ?", self.meta_table());
        conn.query_one(&sql, &[text(id)])?
            .map(|row| self.options.decode(&row))
            .transpose()
    }

    fn rebuild_projections(&self, conn: &dyn Connection, record: &Record) -> StorageResult<()> {
        let Some(collection) = record.collection() else {
            return Ok(());
        };
        for config in self.options.projections_for(collection) {
            let table = qualify(None, &self.projection_table(config));
            config.rebuild(conn, &table, &record.id, &record.payload)?;
        }
        Ok(())
    }

    fn delete_projection_rows(&self, conn: &dyn Connection, collection: Option<&str>, id: &str) -> StorageResult<()> {
        let configs: Vec<&ProjectionConfig> = match collection {
            Some(c) => self.options.projections_for(c).collect(),
            None => self.options.projections.iter().collect(),
        };
        for config in configs {
            projection::delete_rows(conn, &qualify(None, &self.projection_table(config)), id)?;
        }
        Ok(())
    }
}

impl SchemaStrategy for SingleTableStrategy {
    fn initialize_schema(&self, conn: &dyn Connection) -> StorageResult<()> {
        let mut ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {meta} (
                id TEXT PRIMARY KEY,
                data JSON NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {docs} (
                id TEXT PRIMARY KEY,
                data JSON NOT NULL
            );
            "#,
            meta = self.meta_table(),
            docs = self.docs_table()
        );
        for config in &self.options.projections {
            ddl.push_str(&config.create_table_sql(&qualify(None, &self.projection_table(config))));
            ddl.push(';');
        }
        if self.options.collections.values().any(|c| !c.indexes.is_empty()) {
            debug!("Single-table layout ignores per-collection indexes");
        }

        conn.execute_batch(&ddl)
    }

    fn table_name(&self, collection: &str) -> String {
        match collection {
            super::naming::META_COLLECTION | super::naming::INVENTORY_COLLECTION => {
                self.physical(META)
            }
            _ => self.physical(DOCS),
        }
    }

    fn write_records(&self, conn: &dyn Connection, batch: &WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // Validate and encrypt everything before touching the database
        let mut meta_rows = Vec::with_capacity(batch.meta.len());
        for record in &batch.meta {
            if record.id.is_empty() || record.id == INVENTORY_ROW_ID {
                return Err(StorageError::validation(format!(
                    "'{}' is not a valid meta record id",
                    record.id
                )));
            }
            check_reserved_keys(&record.payload)?;
            let data = serde_json::Value::Object(record.payload.clone()).to_string();
            meta_rows.push((record.id.as_str(), data));
        }

        let mut doc_rows = Vec::with_capacity(batch.docs.len());
        for record in &batch.docs {
            if record.id.is_empty() {
                return Err(StorageError::validation("document id must not be empty"));
            }
            let data = self.options.seal(record.collection(), &record.payload)?;
            let inventory_key = match (record.collection(), record.version()?) {
                (Some(collection), Some(version)) => Some((
                    collection,
                    record.doc_id(collection),
                    version,
                    record.has_pending_ops(),
                )),
                _ => None,
            };
            doc_rows.push((record, data, inventory_key));
        }

        with_transaction(conn, "write_records", |c| {
            let mut inventory = self.read_inventory(c)?;
            let mut inventory_changed = false;
            for (_, _, key) in &doc_rows {
                if let Some((collection, doc_id, version, pending)) = key {
                    let change = InventoryChange::new(collection, doc_id, version).with_pending_ops(*pending);
                    inventory.apply(&change, InventoryOperation::Update)?;
                    inventory_changed = true;
                }
            }

            for (id, data) in &meta_rows {
                c.execute(
                    &format!("INSERT OR REPLACE INTO {} (id, data) VALUES (?, ?)", self.meta_table()),
                    &[text(id), text(data)],
                )?;
            }
            for (record, data, _) in &doc_rows {
                c.execute(
                    &format!("INSERT OR REPLACE INTO {} (id, data) VALUES (?, ?)", self.docs_table()),
                    &[text(&record.id), text(data)],
                )?;
                self.rebuild_projections(c, record)?;
            }

            if inventory_changed {
                self.save_inventory(c, &inventory)?;
            }
            Ok(())
        })
    }

    fn read_record(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        _collection: Option<&str>,
        id: &str,
    ) -> StorageResult<Option<Record>> {
        match record_type {
            RecordType::Meta => self.read_meta(conn, id),
            RecordType::Docs => self.read_doc(conn, id),
        }
    }

    fn read_records_bulk(
        &self,
        conn: &dyn Connection,
        record_type: RecordType,
        _collection: Option<&str>,
        ids: &[String],
    ) -> StorageResult<Vec<Record>> {
        let table = match record_type {
            RecordType::Docs => self.docs_table(),
            RecordType::Meta => self.meta_table(),
        };
        let ids: Vec<&str> = dedup_ids(ids)
            .into_iter()
            .filter(|id| record_type == RecordType::Docs || *id != INVENTORY_ROW_ID)
            .collect();

        let mut found = HashMap::new();
        for chunk in ids.chunks(MAX_BATCH_PARAMS) {
            let sql = format!(
                "SELECT id, data FROM {} WHERE id IN ({})",
                table,
                placeholders(chunk.len())
            );
            let params: Vec<SqlValue> = chunk.iter().map(|id| text(id)).collect();
            for row in conn.query_all(&sql, &params)? {
                let record = self.options.decode(&row)?;
                found.insert(record.id.clone(), record);
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
        match record_type {
            RecordType::Meta => {
                let sql = format!(
                    "SELECT id, data FROM {} WHERE id != ? ORDER BY id",
                    self.meta_table()
                );
                conn.query_all(&sql, &[text(INVENTORY_ROW_ID)])?
                    .iter()
                    .map(|row| self.options.decode(row))
                    .collect()
            }
            RecordType::Docs => {
                let sql = format!("SELECT id, data FROM {} ORDER BY id", self.docs_table());
                let mut records = Vec::new();
                for row in conn.query_all(&sql, &[])? {
                    let record = self.options.decode(&row)?;
                    if collection.map_or(true, |c| record.collection() == Some(c)) {
                        records.push(record);
                    }
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
            if id != INVENTORY_ROW_ID {
                conn.execute(
                    &format!("DELETE FROM {} WHERE id = ?", self.meta_table()),
                    &[text(id)],
                )?;
            }
            return Ok(());
        }

        // The stored payload knows the collection and document id
        let existing = self.read_doc(conn, id)?;
        let collection = collection
            .map(str::to_string)
            .or_else(|| existing.as_ref().and_then(|r| r.collection().map(str::to_string)));
        let doc_id = match (&existing, &collection) {
            (Some(record), Some(c)) => Some(record.doc_id(c)),
            (None, Some(c)) => Some(unqualified_id(c, id).to_string()),
            _ => None,
        };

        with_transaction(conn, "delete_record", |c| {
            c.execute(
                &format!("DELETE FROM {} WHERE id = ?", self.docs_table()),
                &[text(id)],
            )?;
            self.delete_projection_rows(c, collection.as_deref(), id)?;

            if let (Some(collection), Some(doc_id)) = (&collection, &doc_id) {
                let mut inventory = self.read_inventory(c)?;
                if inventory.remove(collection, doc_id).is_some() {
                    self.save_inventory(c, &inventory)?;
                }
            }
            Ok(())
        })
    }

    fn update_inventory_item(
        &self,
        conn: &dyn Connection,
        change: &InventoryChange<'_>,
        operation: InventoryOperation,
    ) -> StorageResult<()> {
        with_transaction(conn, "update_inventory_item", |c| {
            let mut inventory = self.read_inventory(c)?;
            inventory.apply(change, operation)?;
            self.save_inventory(c, &inventory)
        })
    }

    fn read_inventory(&self, conn: &dyn Connection) -> StorageResult<Inventory> {
        let sql = format!("SELECT data FROM {} WHERE id = ?", self.meta_table());
        match conn.query_one(&sql, &[text(INVENTORY_ROW_ID)])? {
            Some(row) => Ok(serde_json::from_str(&row.text("data")?)?),
            None => Ok(Inventory::new()),
        }
    }

    fn initialize_inventory(&self, conn: &dyn Connection) -> StorageResult<Inventory> {
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (id, data) VALUES (?, ?)",
                self.meta_table()
            ),
            &[text(INVENTORY_ROW_ID), SqlValue::Text(serde_json::to_string(&Inventory::new())?)],
        )?;
        self.read_inventory(conn)
    }

    fn delete_all_tables(&self, conn: &dyn Connection) -> StorageResult<()> {
        let mut tables = vec![self.physical(DOCS), self.physical(META)];
        tables.extend(self.options.projections.iter().map(|p| self.projection_table(p)));
        if self.mapper.is_none() {
            // Projection tables left over from earlier configurations
            let prefix = format!("{}{}", self.prefix, PROJECTION_TABLE_PREFIX);
            tables.extend(list_tables_with_prefix(conn, None, &prefix)?);
        }
        tables.sort();
        tables.dedup();

        drop_tables(conn, None, &tables)
    }
}

fn sanitize_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        String::new()
    } else {
        sanitize(prefix)
    }
}
