//! Database connection boundary
//!
//! Schema strategies only ever talk to the database through the
//! [`Connection`] trait: parameterized statements, single/multi-row
//! queries and atomic statement groups. [`SqliteConnection`] is the
//! bundled implementation over `rusqlite`; it also owns the retry of
//! transient busy/locked failures, so callers above this layer only see
//! the final outcome.

pub mod retry;
pub mod sqlite;

pub use retry::RetryPolicy;
pub use sqlite::SqliteConnection;

use rusqlite::types::Value;
use tracing::warn;

use crate::error::{StorageError, StorageResult};

/// Outcome of a non-query statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteResult {
    pub changed_rows: usize,
    pub last_insert_id: Option<i64>,
}

/// A result row, addressable by column name
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Raw value of a column, `None` if the column is not in the row
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    /// Text column; NULL or missing yields `None`
    pub fn opt_text(&self, column: &str) -> Option<String> {
        match self.value(column)? {
            Value::Text(s) => Some(s.clone()),
            Value::Blob(b) => String::from_utf8(b.clone()).ok(),
            _ => None,
        }
    }

    /// Text column that must be present
    pub fn text(&self, column: &str) -> StorageResult<String> {
        self.opt_text(column).ok_or_else(|| {
            StorageError::validation(format!("column '{}' is missing or not text", column))
        })
    }

    pub fn opt_real(&self, column: &str) -> Option<f64> {
        match self.value(column)? {
            Value::Real(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn opt_integer(&self, column: &str) -> Option<i64> {
        match self.value(column)? {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

/// Closure run inside [`Connection::run_in_transaction`]
pub type TransactionFn<'a> = dyn FnMut(&dyn Connection) -> StorageResult<()> + 'a;

/// Capability set every database connection provides
pub trait Connection {
    /// Run a single parameterized statement
    fn execute(&self, sql: &str, params: &[Value]) -> StorageResult<ExecuteResult>;

    /// Run several parameterless statements (DDL)
    fn execute_batch(&self, sql: &str) -> StorageResult<()>;

    /// First row of a query, `None` when the query matches nothing
    fn query_one(&self, sql: &str, params: &[Value]) -> StorageResult<Option<Row>>;

    /// All rows of a query
    fn query_all(&self, sql: &str, params: &[Value]) -> StorageResult<Vec<Row>>;

    /// Run `f` atomically: commit on `Ok`, roll back and return the error on `Err`
    fn run_in_transaction(&self, f: &mut TransactionFn<'_>) -> StorageResult<()>;

    /// Whether `run_in_transaction` can actually provide atomicity
    fn supports_transactions(&self) -> bool {
        true
    }

    /// Open the underlying database; no-op when already open
    fn connect(&mut self) -> StorageResult<()>;

    /// Close the underlying database; no-op when already closed
    fn disconnect(&mut self) -> StorageResult<()>;

    fn is_connected(&self) -> bool;
}

/// Run `f` in a transaction when the connection supports one
///
/// Connections that cannot provide transactions get the statements
/// executed directly. That weakens atomicity, so it is always logged.
pub fn with_transaction<F>(conn: &dyn Connection, operation: &str, mut f: F) -> StorageResult<()>
where
    F: FnMut(&dyn Connection) -> StorageResult<()>,
{
    if conn.supports_transactions() {
        conn.run_in_transaction(&mut f)
    } else {
        warn!(
            "{}: connection does not support transactions, running statements without atomicity",
            operation
        );
        f(conn)
    }
}

/// Build a text parameter
pub fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

/// Quote an identifier for interpolation into SQL
///
/// Identifiers reaching this point are already sanitized; quoting keeps
/// reserved words (e.g. a collection named `order`) valid.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_accessors() {
        let row = Row::new(
            vec!["id".into(), "n".into(), "f".into(), "nothing".into()],
            vec![
                Value::Text("a".into()),
                Value::Integer(3),
                Value::Real(1.5),
                Value::Null,
            ],
        );

        assert_eq!(row.text("id").unwrap(), "a");
        assert_eq!(row.opt_integer("n"), Some(3));
        assert_eq!(row.opt_real("n"), Some(3.0));
        assert_eq!(row.opt_real("f"), Some(1.5));
        assert_eq!(row.opt_text("nothing"), None);
        assert!(row.text("missing").is_err());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("coll_users"), "\"coll_users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
