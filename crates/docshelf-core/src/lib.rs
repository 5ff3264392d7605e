//! docshelf Core Library
//!
//! This crate persists JSON documents for an offline-first sync client in
//! SQLite. Documents, metadata records and a per-document version
//! inventory are stored through one of several interchangeable schema
//! layouts.
//!
//! # Architecture
//!
//! - **Connection**: a small trait over SQLite (statements, queries,
//!   transactions), with retry on busy/locked errors
//! - **Schema strategies**: single table, one table per collection, or one
//!   table per collection inside an attached database file
//! - **Inventory**: `(collection, docId) -> version` ledger enforcing
//!   monotonic versions that never change type
//! - **Encryption**: optional whole-payload or field-level hooks
//! - **Projections**: flattened read-only copies of documents for querying
//!
//! # Quick Start
//!
//! ```text
//! let store = Store::open(Config::load()?, None)?;
//!
//! store.put("term", "t1", json!({"v": 1, "label": "Rust"}))?;
//! let term = store.get("term", "term/t1")?;
//! let inventory = store.inventory()?;
//! ```
//!
//! # Modules
//!
//! - `store`: Unified storage interface (main entry point)
//! - `schema`: Schema strategies, projections and table naming
//! - `inventory`: Version ledger and its transition rules
//! - `record`: Records, write batches and store names
//! - `connection`: Database connection abstraction
//! - `attachment`: Secondary database files
//! - `encryption`: Payload encryption hooks
//! - `config`: Application configuration

pub mod attachment;
pub mod config;
pub mod connection;
pub mod encryption;
pub mod error;
pub mod inventory;
pub mod record;
pub mod schema;
pub mod store;

pub use attachment::{AttachmentConfig, AttachmentManager};
pub use config::Config;
pub use connection::{Connection, RetryPolicy, SqliteConnection};
pub use encryption::Encryption;
pub use error::{StorageError, StorageResult};
pub use inventory::{Inventory, InventoryEntry, InventoryOperation, Version};
pub use record::{Record, RecordType, WriteBatch};
pub use schema::{
    AttachedCollectionTableStrategy, CollectionTableStrategy, ProjectionConfig, SchemaOptions,
    SchemaStrategy, SingleTableStrategy, Strategy, StrategyKind,
};
pub use store::{AsyncStore, Store};
