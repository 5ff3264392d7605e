//! Catalog introspection over `sqlite_master`

use crate::connection::{text, Connection};
use crate::error::StorageResult;
use crate::schema::naming::{master_table, qualify};

/// All user tables of a schema, in name order
pub fn list_tables(conn: &dyn Connection, schema: Option<&str>) -> StorageResult<Vec<String>> {
    let sql = format!(
        "SELECT name FROM {} WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' ORDER BY name",
        master_table(schema)
    );
    conn.query_all(&sql, &[])?
        .iter()
        .map(|row| row.text("name"))
        .collect()
}

/// Tables of a schema whose name starts with `prefix`
pub fn list_tables_with_prefix(
    conn: &dyn Connection,
    schema: Option<&str>,
    prefix: &str,
) -> StorageResult<Vec<String>> {
    Ok(list_tables(conn, schema)?
        .into_iter()
        .filter(|name| name.starts_with(prefix))
        .collect())
}

pub fn table_exists(conn: &dyn Connection, schema: Option<&str>, table: &str) -> StorageResult<bool> {
    let sql = format!(
        "SELECT 1 AS found FROM {} WHERE type = 'table' AND name = ?",
        master_table(schema)
    );
    Ok(conn.query_one(&sql, &[text(table)])?.is_some())
}

/// Named indexes defined on a table
pub fn list_indexes(
    conn: &dyn Connection,
    schema: Option<&str>,
    table: &str,
) -> StorageResult<Vec<String>> {
    let sql = format!(
        "SELECT name FROM {} WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL ORDER BY name",
        master_table(schema)
    );
    conn.query_all(&sql, &[text(table)])?
        .iter()
        .map(|row| row.text("name"))
        .collect()
}

pub fn index_exists(conn: &dyn Connection, schema: Option<&str>, index: &str) -> StorageResult<bool> {
    let sql = format!(
        "SELECT 1 AS found FROM {} WHERE type = 'index' AND name = ?",
        master_table(schema)
    );
    Ok(conn.query_one(&sql, &[text(index)])?.is_some())
}

/// Drop tables, treating already-missing tables as dropped
pub fn drop_tables(conn: &dyn Connection, schema: Option<&str>, tables: &[String]) -> StorageResult<()> {
    for table in tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", qualify(schema, table)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SqliteConnection;

    #[test]
    fn test_listing() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE coll_a (id TEXT PRIMARY KEY, data JSON);
            CREATE TABLE coll_b (id TEXT PRIMARY KEY, data JSON);
            CREATE TABLE other (id INTEGER PRIMARY KEY AUTOINCREMENT);
            CREATE INDEX idx_coll_a_x ON coll_a (json_extract(data, '$.x'));
            "#,
        )
        .unwrap();

        let tables = list_tables(&conn, None).unwrap();
        // AUTOINCREMENT creates sqlite_sequence, which is filtered out
        assert_eq!(tables, vec!["coll_a", "coll_b", "other"]);

        assert_eq!(
            list_tables_with_prefix(&conn, None, "coll_").unwrap(),
            vec!["coll_a", "coll_b"]
        );
        assert!(table_exists(&conn, None, "coll_a").unwrap());
        assert!(!table_exists(&conn, None, "coll_z").unwrap());

        // Automatic primary-key indexes have no SQL and are not listed
        assert_eq!(list_indexes(&conn, None, "coll_a").unwrap(), vec!["idx_coll_a_x"]);
        assert!(index_exists(&conn, None, "idx_coll_a_x").unwrap());
    }

    #[test]
    fn test_drop_tolerates_missing() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE coll_a (id TEXT)").unwrap();

        drop_tables(&conn, None, &["coll_a".to_string(), "coll_gone".to_string()]).unwrap();
        assert!(list_tables(&conn, None).unwrap().is_empty());
    }
}
