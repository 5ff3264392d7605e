//! Storage error handling
//!
//! Provides typed errors for storage operations with descriptive messages
//! and recovery suggestions.
//!
//! Absent records and inventory entries are never errors: lookups return
//! `Ok(None)` or omit the id from bulk results.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Input rejected before anything was written
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A version of a different type than the stored one was supplied
    #[error(
        "Version type mismatch for {collection}/{doc_id}: stored version is a {stored}, got a {attempted}"
    )]
    VersionTypeMismatch {
        collection: String,
        doc_id: String,
        stored: &'static str,
        attempted: &'static str,
    },

    /// A version lower than the stored one was supplied
    #[error("Version regression for {collection}/{doc_id}: stored {stored}, got {attempted}")]
    VersionRegression {
        collection: String,
        doc_id: String,
        stored: String,
        attempted: String,
    },

    /// Attachment target does not exist and may not be created
    #[error("Cannot attach '{alias}': database file '{path}' does not exist")]
    AttachmentFileMissing { alias: String, path: PathBuf },

    /// Attach or detach statement failed
    #[error("Attachment '{alias}' failed: {reason}")]
    Attachment { alias: String, reason: String },

    /// Database stayed busy or locked after every retry
    #[error("Database busy after {attempts} attempts: {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    /// Connection used after disconnect (or before connect)
    #[error("Connection to '{path}' is not open")]
    NotConnected { path: String },

    /// Encryption hook produced unusable output
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored JSON could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to create directory or file
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    /// Create an I/O error with path context
    pub fn from_io(error: io::Error, path: impl Into<PathBuf>) -> Self {
        StorageError::Io {
            path: path.into(),
            source: error,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        StorageError::Validation(msg.into())
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors leave the store usable; retrying later or
    /// correcting the input can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::Transient { .. }
                | StorageError::Validation(_)
                | StorageError::VersionTypeMismatch { .. }
                | StorageError::VersionRegression { .. }
                | StorageError::AttachmentFileMissing { .. }
                | StorageError::Attachment { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::Transient { .. } => {
                Some("Another process holds a lock on the database. Try again once it finishes.")
            }
            StorageError::AttachmentFileMissing { .. } => {
                Some("Create the database file first or set create_if_not_exists = true for this attachment.")
            }
            StorageError::VersionRegression { .. } => {
                Some("Reload the document to pick up the newer stored version before writing.")
            }
            StorageError::VersionTypeMismatch { .. } => {
                Some("Keep using the same version type (number or string) for a document.")
            }
            StorageError::NotConnected { .. } => Some("Reopen the store before issuing queries."),
            _ => None,
        }
    }
}

/// Check if a rusqlite error is a busy/locked condition worth retrying
pub(crate) fn is_transient(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(err, _) => matches!(
            err.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

/// Check if a rusqlite error reports a table that does not exist
pub(crate) fn is_missing_table(error: &StorageError) -> bool {
    match error {
        StorageError::Database(rusqlite::Error::SqliteFailure(_, Some(msg))) => {
            msg.contains("no such table")
        }
        _ => false,
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
