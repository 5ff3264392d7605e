//! `rusqlite`-backed [`Connection`]

use std::path::Path;

use rusqlite::types::Value;
use rusqlite::params_from_iter;
use tracing::{debug, warn};

use super::{Connection, ExecuteResult, RetryPolicy, Row, TransactionFn};
use crate::error::{StorageError, StorageResult};

/// Path value denoting an in-memory database
pub const MEMORY_PATH: &str = ":memory:";

/// A single physical SQLite database file
pub struct SqliteConnection {
    path: String,
    conn: Option<rusqlite::Connection>,
    retry: RetryPolicy,
}

impl SqliteConnection {
    /// Create an unopened connection for `path`
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            conn: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Open a database file, creating it (and its directory) if needed
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let mut conn = Self::new(path.as_ref().to_string_lossy().into_owned());
        conn.connect()?;
        Ok(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        let mut conn = Self::new(MEMORY_PATH);
        conn.connect()?;
        Ok(conn)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get a reference to the underlying rusqlite connection
    pub fn raw(&self) -> StorageResult<&rusqlite::Connection> {
        self.conn.as_ref().ok_or_else(|| StorageError::NotConnected {
            path: self.path.clone(),
        })
    }

    fn fetch(&self, sql: &str, params: &[Value], limit: Option<usize>) -> StorageResult<Vec<Row>> {
        let conn = self.raw()?;
        self.retry.run(|| {
            let mut stmt = conn.prepare(sql)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let count = columns.len();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;

            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let values = (0..count)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                out.push(Row::new(columns.clone(), values));
                if limit.is_some_and(|l| out.len() >= l) {
                    break;
                }
            }
            Ok(out)
        })
    }
}

impl Connection for SqliteConnection {
    fn execute(&self, sql: &str, params: &[Value]) -> StorageResult<ExecuteResult> {
        let conn = self.raw()?;
        let changed_rows = self
            .retry
            .run(|| conn.execute(sql, params_from_iter(params.iter())))?;
        let rowid = conn.last_insert_rowid();

        Ok(ExecuteResult {
            changed_rows,
            last_insert_id: (rowid != 0).then_some(rowid),
        })
    }

    fn execute_batch(&self, sql: &str) -> StorageResult<()> {
        let conn = self.raw()?;
        self.retry.run(|| conn.execute_batch(sql))
    }

    fn query_one(&self, sql: &str, params: &[Value]) -> StorageResult<Option<Row>> {
        Ok(self.fetch(sql, params, Some(1))?.into_iter().next())
    }

    fn query_all(&self, sql: &str, params: &[Value]) -> StorageResult<Vec<Row>> {
        self.fetch(sql, params, None)
    }

    fn run_in_transaction(&self, f: &mut TransactionFn<'_>) -> StorageResult<()> {
        let conn = self.raw()?;

        // Nested calls join the outer transaction
        if !conn.is_autocommit() {
            return f(self);
        }

        self.retry.run(|| conn.execute_batch("BEGIN IMMEDIATE"))?;

        match f(self) {
            Ok(()) => {
                if let Err(e) = self.retry.run(|| conn.execute_batch("COMMIT")) {
                    if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                        warn!("Rollback after failed commit also failed: {}", rollback);
                    }
                    return Err(e);
                }
                Ok(())
            }
            Err(e) => {
                debug!("Rolling back transaction: {}", e);
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    warn!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    fn connect(&mut self) -> StorageResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }

        let conn = if self.path == MEMORY_PATH {
            rusqlite::Connection::open_in_memory()?
        } else {
            let path = Path::new(&self.path);
            // Ensure parent directory exists
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::from_io(e, parent))?;
            }
            rusqlite::Connection::open(path)?
        };

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        debug!("Opened database {}", self.path);
        self.conn = Some(conn);
        Ok(())
    }

    fn disconnect(&mut self) -> StorageResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };

        conn.close().map_err(|(_, e)| StorageError::Database(e))?;
        debug!("Closed database {}", self.path);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("Failed to close database {}: {}", self.path, e);
        }
    }
}
