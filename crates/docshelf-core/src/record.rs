//! Records as handed over by the sync framework
//!
//! A record is a document snapshot (or a piece of bookkeeping metadata)
//! with a storage key and an opaque JSON payload. Document payloads
//! carry their owning `collection`, the unqualified document `id`, the
//! version `v` and any pending operations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StorageError, StorageResult};
use crate::inventory::Version;

/// Payload keys the storage layer understands
pub mod keys {
    pub const COLLECTION: &str = "collection";
    pub const ID: &str = "id";
    pub const VERSION: &str = "v";
    pub const PENDING_OPS: &str = "pendingOps";
    pub const INFLIGHT_OP: &str = "inflightOp";
}

/// Store name reserved for metadata records
pub const META_STORE: &str = "meta";

/// A stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Storage key, possibly compound (`collection/docId`)
    pub id: String,
    pub payload: Map<String, Value>,
}

/// Which family of records an operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Docs,
    Meta,
}

/// A write request, keyed by record type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub docs: Vec<Record>,
    pub meta: Vec<Record>,
}

impl Record {
    pub fn new(id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Build a record from a JSON value that must be an object
    pub fn from_value(id: impl Into<String>, payload: Value) -> StorageResult<Self> {
        let id = id.into();
        match payload {
            Value::Object(map) => Ok(Self::new(id, map)),
            other => Err(StorageError::validation(format!(
                "payload of '{}' must be a JSON object, got {}",
                id, other
            ))),
        }
    }

    /// The payload's `collection`, if it is a non-empty string
    pub fn collection(&self) -> Option<&str> {
        self.payload
            .get(keys::COLLECTION)
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
    }

    /// Collection required by per-collection layouts
    pub fn require_collection(&self) -> StorageResult<&str> {
        self.collection().ok_or_else(|| {
            StorageError::validation(format!(
                "record '{}' has no collection in its payload",
                self.id
            ))
        })
    }

    /// Unqualified document id used as the inventory key
    pub fn doc_id(&self, collection: &str) -> String {
        self.payload
            .get(keys::ID)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| unqualified_id(collection, &self.id).to_string())
    }

    /// Version carried by the payload, if any
    pub fn version(&self) -> StorageResult<Option<Version>> {
        match self.payload.get(keys::VERSION) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Version::from_json(value).map(Some),
        }
    }

    /// Whether the payload carries unacknowledged operations
    pub fn has_pending_ops(&self) -> bool {
        let pending = match self.payload.get(keys::PENDING_OPS) {
            Some(Value::Array(ops)) => !ops.is_empty(),
            Some(Value::Object(ops)) => !ops.is_empty(),
            _ => false,
        };
        let inflight = matches!(self.payload.get(keys::INFLIGHT_OP), Some(v) if !v.is_null());
        pending || inflight
    }
}

impl WriteBatch {
    pub fn docs(docs: Vec<Record>) -> Self {
        Self {
            docs,
            meta: Vec::new(),
        }
    }

    pub fn meta(meta: Vec<Record>) -> Self {
        Self {
            docs: Vec::new(),
            meta,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty() && self.meta.is_empty()
    }
}

/// Split a compound `collection/docId` key
pub fn split_compound_id(id: &str) -> Option<(&str, &str)> {
    id.split_once('/')
        .filter(|(collection, doc)| !collection.is_empty() && !doc.is_empty())
}

/// Strip a leading `collection/` from a storage key
pub fn unqualified_id<'a>(collection: &str, id: &'a str) -> &'a str {
    id.strip_prefix(collection)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(id)
}

/// Resolve a framework store name to a record type and collection
///
/// `"meta"` addresses metadata records; any other name is a collection
/// of documents.
pub fn resolve_store_name(store_name: &str) -> (RecordType, Option<&str>) {
    if store_name == META_STORE {
        (RecordType::Meta, None)
    } else {
        (RecordType::Docs, Some(store_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, payload: Value) -> Record {
        Record::from_value(id, payload).unwrap()
    }

    #[test]
    fn test_require_collection() {
        let ok = record("term/t1", json!({"collection": "term", "id": "t1"}));
        assert_eq!(ok.require_collection().unwrap(), "term");

        let empty = record("x", json!({"collection": ""}));
        assert!(matches!(
            empty.require_collection(),
            Err(StorageError::Validation(_))
        ));

        let missing = record("x", json!({"v": 1}));
        assert!(missing.require_collection().is_err());
    }

    #[test]
    fn test_doc_id_prefers_payload_id() {
        let r = record("term/t1", json!({"collection": "term", "id": "t1"}));
        assert_eq!(r.doc_id("term"), "t1");

        let r = record("term/t2", json!({"collection": "term"}));
        assert_eq!(r.doc_id("term"), "t2");

        let r = record("plain", json!({"collection": "term"}));
        assert_eq!(r.doc_id("term"), "plain");
    }

    #[test]
    fn test_pending_ops_detection() {
        assert!(!record("a", json!({})).has_pending_ops());
        assert!(!record("a", json!({"pendingOps": []})).has_pending_ops());
        assert!(record("a", json!({"pendingOps": [{"op": []}]})).has_pending_ops());
        assert!(record("a", json!({"inflightOp": {"op": []}})).has_pending_ops());
        assert!(!record("a", json!({"inflightOp": null})).has_pending_ops());
    }

    #[test]
    fn test_version_extraction() {
        let r = record("a", json!({"v": 3}));
        assert_eq!(r.version().unwrap(), Some(Version::Number(3.0)));

        let r = record("a", json!({"v": "0003"}));
        assert_eq!(r.version().unwrap(), Some(Version::Text("0003".into())));

        assert_eq!(record("a", json!({})).version().unwrap(), None);
        assert!(record("a", json!({"v": [1]})).version().is_err());
    }

    #[test]
    fn test_non_object_payload_rejected() {
        assert!(Record::from_value("a", json!([1, 2])).is_err());
    }

    #[test]
    fn test_compound_ids() {
        assert_eq!(split_compound_id("term/t1"), Some(("term", "t1")));
        assert_eq!(split_compound_id("t1"), None);
        assert_eq!(split_compound_id("/t1"), None);
        assert_eq!(unqualified_id("term", "term/t1"), "t1");
        assert_eq!(unqualified_id("term", "other/t1"), "other/t1");
        assert_eq!(unqualified_id("term", "t1"), "t1");
    }

    #[test]
    fn test_resolve_store_name() {
        assert_eq!(resolve_store_name("meta"), (RecordType::Meta, None));
        assert_eq!(
            resolve_store_name("posts"),
            (RecordType::Docs, Some("posts"))
        );
    }
}
