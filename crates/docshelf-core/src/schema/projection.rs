//! Array projections
//!
//! A projection expands an array inside a document payload into one row
//! per element so the elements can be queried with plain SQL.
//!
//! ## Table layout
//!
//! - `doc_id` - storage id of the owning document
//! - `item_key` - the element's primary key (or the element itself for scalars)
//! - `position` - index of the element in the array
//! - one column per configured element field
//! - `element` - the full element as JSON
//!
//! Rows are rebuilt from scratch on every write of the owning document
//! (delete then insert) and removed with it.

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::connection::{text, Connection};
use crate::error::{StorageError, StorageResult};
use crate::schema::naming::{json_path, sanitize};

/// Columns every projection table carries
const FIXED_COLUMNS: &[&str] = &["doc_id", "item_key", "position", "element"];

fn default_primary_key() -> String {
    "id".to_string()
}

/// Configuration of one projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionConfig {
    /// Projection name; the table is derived from it
    pub name: String,
    /// Collection whose documents feed this projection
    pub collection: String,
    /// Dotted path of the array inside the payload
    pub array_path: String,
    /// Element field identifying a row within one document
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Element fields copied into their own columns
    #[serde(default)]
    pub columns: Vec<String>,
}

impl ProjectionConfig {
    pub fn new(name: &str, collection: &str, array_path: &str) -> Self {
        Self {
            name: name.to_string(),
            collection: collection.to_string(),
            array_path: array_path.to_string(),
            primary_key: default_primary_key(),
            columns: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, primary_key: &str) -> Self {
        self.primary_key = primary_key.to_string();
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Reject paths and column names that cannot be projected
    pub fn validate(&self) -> StorageResult<()> {
        json_path(&self.array_path)?;
        if self.primary_key.is_empty() {
            return Err(StorageError::validation(format!(
                "projection '{}' needs a primary key",
                self.name
            )));
        }

        let mut seen = Vec::new();
        // SQLite column names are case-insensitive
        for column in &self.columns {
            let name = sanitize(column).to_ascii_lowercase();
            if FIXED_COLUMNS.contains(&name.as_str()) || seen.contains(&name) {
                return Err(StorageError::validation(format!(
                    "projection '{}' has a clashing column '{}'",
                    self.name, column
                )));
            }
            seen.push(name);
        }
        Ok(())
    }

    /// DDL for the projection table at `qualified_table`
    pub fn create_table_sql(&self, qualified_table: &str) -> String {
        let extra: String = self
            .columns
            .iter()
            .map(|c| format!(",\n            \"{}\"", sanitize(c)))
            .collect();

        format!(
            r#"
        CREATE TABLE IF NOT EXISTS {table} (
            doc_id TEXT NOT NULL,
            item_key NOT NULL,
            position INTEGER NOT NULL{extra},
            element JSON NOT NULL,
            PRIMARY KEY (doc_id, item_key)
        )
        "#,
            table = qualified_table,
            extra = extra
        )
    }

    /// Replace this document's rows with rows for `payload`
    ///
    /// Returns the number of rows inserted.
    pub fn rebuild(
        &self,
        conn: &dyn Connection,
        qualified_table: &str,
        doc_id: &str,
        payload: &Map<String, Value>,
    ) -> StorageResult<usize> {
        delete_rows(conn, qualified_table, doc_id)?;

        let elements = match lookup(payload, &self.array_path) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => return Ok(0),
            Some(_) => {
                warn!(
                    "Projection '{}': '{}' in document {} is not an array, skipping",
                    self.name, self.array_path, doc_id
                );
                return Ok(0);
            }
        };

        let columns: String = self
            .columns
            .iter()
            .map(|c| format!(", \"{}\"", sanitize(c)))
            .collect();
        let placeholders = ", ?".repeat(self.columns.len());
        let sql = format!(
            "INSERT OR REPLACE INTO {} (doc_id, item_key, position{}, element) VALUES (?, ?, ?{}, ?)",
            qualified_table, columns, placeholders
        );

        let mut inserted = 0;
        for (position, element) in elements.iter().enumerate() {
            let Some(key) = self.element_key(element) else {
                warn!(
                    "Projection '{}': element {} of document {} has no '{}', skipping",
                    self.name, position, doc_id, self.primary_key
                );
                continue;
            };

            let mut params = vec![text(doc_id), key, SqlValue::Integer(position as i64)];
            for column in &self.columns {
                let value = element.as_object().and_then(|obj| obj.get(column));
                params.push(value.map(to_sql_value).unwrap_or(SqlValue::Null));
            }
            params.push(SqlValue::Text(serde_json::to_string(element)?));

            conn.execute(&sql, &params)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    fn element_key(&self, element: &Value) -> Option<SqlValue> {
        match element {
            Value::Object(obj) => match obj.get(&self.primary_key)? {
                Value::Null | Value::Array(_) | Value::Object(_) => None,
                scalar => Some(to_sql_value(scalar)),
            },
            Value::String(_) | Value::Number(_) | Value::Bool(_) => Some(to_sql_value(element)),
            _ => None,
        }
    }
}

/// Remove every row derived from one document
pub fn delete_rows(conn: &dyn Connection, qualified_table: &str, doc_id: &str) -> StorageResult<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE doc_id = ?", qualified_table),
        &[text(doc_id)],
    )?;
    Ok(())
}

/// Follow a dotted path (with optional `[n]` indexes) into a payload
fn lookup<'a>(payload: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = index_into(payload.get(field_name(first))?, first)?;
    for segment in segments {
        current = index_into(current.as_object()?.get(field_name(segment))?, segment)?;
    }
    Some(current)
}

fn field_name(segment: &str) -> &str {
    segment.split('[').next().unwrap_or(segment)
}

fn index_into<'a>(mut value: &'a Value, segment: &str) -> Option<&'a Value> {
    for part in segment.split('[').skip(1) {
        let index: usize = part.trim_end_matches(']').parse().ok()?;
        value = value.as_array()?.get(index)?;
    }
    Some(value)
}

/// Convert a JSON scalar to its SQLite representation
fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
