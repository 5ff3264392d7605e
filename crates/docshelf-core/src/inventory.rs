//! Inventory ledger
//!
//! Tracks, per `(collection, docId)`, the latest stored version and
//! whether the stored snapshot still carries pending operations.
//!
//! Two invariants hold for every key:
//!
//! - **Type stability**: a version first written as a number stays a
//!   number (likewise for strings).
//! - **Monotonicity**: an accepted version is never lower than the one
//!   already stored.
//!
//! [`check_transition`] enforces both and is shared by every storage
//! representation. [`Inventory`] is the in-memory form; the single-table
//! layout persists it as one JSON document, the per-collection layouts
//! persist it row by row in an indexed table.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StorageError, StorageResult};

/// A document version: numeric or string, never both
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Version {
    Number(f64),
    Text(String),
}

impl Version {
    /// Parse a version from a payload value
    pub fn from_json(value: &Value) -> StorageResult<Self> {
        match value {
            Value::Number(n) => n
                .as_f64()
                .map(Version::Number)
                .ok_or_else(|| StorageError::validation(format!("unrepresentable version {}", n))),
            Value::String(s) => Ok(Version::Text(s.clone())),
            other => Err(StorageError::validation(format!(
                "version must be a number or a string, got {}",
                other
            ))),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Version::Number(_) => "number",
            Version::Text(_) => "string",
        }
    }

    /// Order two versions of the same type; `None` across types
    pub fn compare(&self, other: &Version) -> Option<Ordering> {
        match (self, other) {
            (Version::Number(a), Version::Number(b)) => a.partial_cmp(b),
            (Version::Text(a), Version::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    fn validate(&self) -> StorageResult<()> {
        match self {
            Version::Number(n) if !n.is_finite() => Err(StorageError::validation(format!(
                "version must be a finite number, got {}",
                n
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Number(n) => write!(f, "{}", n),
            Version::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<f64> for Version {
    fn from(n: f64) -> Self {
        Version::Number(n)
    }
}

impl From<i64> for Version {
    fn from(n: i64) -> Self {
        Version::Number(n as f64)
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Version::Text(s.to_string())
    }
}

/// Inventory operation vocabulary of the sync framework
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InventoryOperation {
    Add,
    Update,
    Remove,
}

impl FromStr for InventoryOperation {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(InventoryOperation::Add),
            "update" => Ok(InventoryOperation::Update),
            "remove" => Ok(InventoryOperation::Remove),
            other => Err(StorageError::validation(format!(
                "unknown inventory operation '{}'",
                other
            ))),
        }
    }
}

/// A requested inventory change for one key
#[derive(Debug, Clone, Copy)]
pub struct InventoryChange<'a> {
    pub collection: &'a str,
    pub doc_id: &'a str,
    pub version: &'a Version,
    pub has_pending_ops: bool,
}

impl<'a> InventoryChange<'a> {
    pub fn new(collection: &'a str, doc_id: &'a str, version: &'a Version) -> Self {
        Self {
            collection,
            doc_id,
            version,
            has_pending_ops: false,
        }
    }

    pub fn with_pending_ops(mut self, has_pending_ops: bool) -> Self {
        self.has_pending_ops = has_pending_ops;
        self
    }
}

/// Stored state of one inventory key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryEntry {
    pub version: Version,
    pub has_pending_ops: bool,
    /// Milliseconds since the Unix epoch
    pub updated_at: i64,
}

impl InventoryEntry {
    pub fn from_change(change: &InventoryChange<'_>) -> Self {
        Self {
            version: change.version.clone(),
            has_pending_ops: change.has_pending_ops,
            updated_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Validate moving a key from `stored` to `next`
pub fn check_transition(
    collection: &str,
    doc_id: &str,
    stored: Option<&Version>,
    next: &Version,
) -> StorageResult<()> {
    next.validate()?;

    let Some(stored) = stored else {
        return Ok(());
    };

    match stored.compare(next) {
        None => Err(StorageError::VersionTypeMismatch {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            stored: stored.type_name(),
            attempted: next.type_name(),
        }),
        Some(Ordering::Greater) => Err(StorageError::VersionRegression {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            stored: stored.to_string(),
            attempted: next.to_string(),
        }),
        Some(_) => Ok(()),
    }
}

/// In-memory inventory, grouped by collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub collections: BTreeMap<String, BTreeMap<String, InventoryEntry>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection: &str, doc_id: &str) -> Option<&InventoryEntry> {
        self.collections.get(collection)?.get(doc_id)
    }

    pub fn contains(&self, collection: &str, doc_id: &str) -> bool {
        self.get(collection, doc_id).is_some()
    }

    /// Total number of tracked documents
    pub fn len(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Collections holding a document with this id, in name order
    pub fn collections_for(&self, doc_id: &str) -> Vec<&str> {
        self.collections
            .iter()
            .filter(|(_, docs)| docs.contains_key(doc_id))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub(crate) fn insert(&mut self, collection: &str, doc_id: &str, entry: InventoryEntry) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(doc_id.to_string(), entry);
    }

    /// Apply an operation, enforcing both invariants
    ///
    /// On error the inventory is left untouched.
    pub fn apply(
        &mut self,
        change: &InventoryChange<'_>,
        operation: InventoryOperation,
    ) -> StorageResult<()> {
        match operation {
            InventoryOperation::Remove => {
                self.remove(change.collection, change.doc_id);
                Ok(())
            }
            InventoryOperation::Add | InventoryOperation::Update => {
                let stored = self
                    .get(change.collection, change.doc_id)
                    .map(|e| &e.version);
                check_transition(change.collection, change.doc_id, stored, change.version)?;
                self.insert(
                    change.collection,
                    change.doc_id,
                    InventoryEntry::from_change(change),
                );
                Ok(())
            }
        }
    }

    /// Remove a key, pruning its collection once empty
    pub fn remove(&mut self, collection: &str, doc_id: &str) -> Option<InventoryEntry> {
        let docs = self.collections.get_mut(collection)?;
        let removed = docs.remove(doc_id);
        if docs.is_empty() {
            self.collections.remove(collection);
        }
        removed
    }
}
