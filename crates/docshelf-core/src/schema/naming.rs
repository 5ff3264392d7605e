//! Table, index and JSON-path naming
//!
//! Everything interpolated into SQL passes through here. User-supplied
//! names are reduced to `[A-Za-z0-9_]` and collection tables always get
//! the `coll_` prefix, so no collection name can produce a system table
//! name. Collection names are escaped rather than reduced, so distinct
//! collections never share a table.

use std::fmt::Write;

use crate::connection::quote_ident;
use crate::error::{StorageError, StorageResult};

/// Framework name for the metadata "collection"
pub const META_COLLECTION: &str = "__meta__";
/// Framework name for the inventory "collection"
pub const INVENTORY_COLLECTION: &str = "__inventory__";

/// Prefix of every per-collection table
pub const COLLECTION_TABLE_PREFIX: &str = "coll_";
/// Prefix of every projection table
pub const PROJECTION_TABLE_PREFIX: &str = "proj_";

/// Replace anything outside `[A-Za-z0-9_]` with `_`
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Escape a name into `[A-Za-z0-9_]`, keeping distinct names distinct
///
/// `_` becomes `__` and every other byte outside `[A-Za-z0-9]` becomes
/// `_` plus two lowercase hex digits.
pub fn escape(name: &str) -> String {
    if name.is_empty() {
        return "_".to_string();
    }
    let mut escaped = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'_' => escaped.push_str("__"),
            b if b.is_ascii_alphanumeric() => escaped.push(b as char),
            b => {
                let _ = write!(escaped, "_{:02x}", b);
            }
        }
    }
    escaped
}

/// Table holding one collection's documents
pub fn collection_table(collection: &str) -> String {
    format!("{}{}", COLLECTION_TABLE_PREFIX, escape(collection))
}

/// Table holding one projection's rows
pub fn projection_table(name: &str) -> String {
    format!("{}{}", PROJECTION_TABLE_PREFIX, sanitize(name))
}

/// Index over one JSON path of a table's `data` column
pub fn index_name(table: &str, field: &str) -> String {
    format!("idx_{}_{}", table, sanitize(field))
}

/// `"schema"."table"`, or just `"table"` without a schema
pub fn qualify(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(table)),
        None => quote_ident(table),
    }
}

/// The catalog table of a schema
pub fn master_table(schema: Option<&str>) -> String {
    match schema {
        Some(schema) => format!("{}.sqlite_master", quote_ident(schema)),
        None => "sqlite_master".to_string(),
    }
}

/// Check an attachment alias is a plain identifier usable as a schema name
pub fn validate_alias(alias: &str) -> StorageResult<()> {
    let mut chars = alias.chars();
    let starts_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !starts_ok || !rest_ok {
        return Err(StorageError::validation(format!(
            "attachment alias '{}' must be a plain identifier",
            alias
        )));
    }
    if alias.eq_ignore_ascii_case("main") || alias.eq_ignore_ascii_case("temp") {
        return Err(StorageError::validation(format!(
            "attachment alias '{}' is reserved",
            alias
        )));
    }
    Ok(())
}

/// Turn a dotted field path (`profile.emails[0]`) into a JSON path
pub fn json_path(field: &str) -> StorageResult<String> {
    let invalid = || StorageError::validation(format!("invalid field path '{}'", field));

    if field.is_empty() {
        return Err(invalid());
    }
    for segment in field.split('.') {
        let (name, indexes) = match segment.find('[') {
            Some(pos) => segment.split_at(pos),
            None => (segment, ""),
        };
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid());
        }
        let mut rest = indexes;
        while !rest.is_empty() {
            let (digits, after) = rest
                .strip_prefix('[')
                .and_then(|inner| inner.split_once(']'))
                .ok_or_else(invalid)?;
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            rest = after;
        }
    }
    Ok(format!("$.{}", field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("users"), "users");
        assert_eq!(sanitize("my-docs.v2"), "my_docs_v2");
        assert_eq!(sanitize("x\"; DROP TABLE y; --"), "x___DROP_TABLE_y____");
        assert_eq!(sanitize(""), "_");
    }

    #[test]
    fn test_collection_tables_never_collide_with_system_tables() {
        for name in ["meta", "inventory", "sharedb_meta", "sharedb_inventory", "docs"] {
            let table = collection_table(name);
            assert!(table.starts_with(COLLECTION_TABLE_PREFIX));
            assert_ne!(table, "sharedb_meta");
            assert_ne!(table, "sharedb_inventory");
        }
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify(None, "coll_users"), "\"coll_users\"");
        assert_eq!(qualify(Some("aux"), "coll_users"), "\"aux\".\"coll_users\"");
        assert_eq!(master_table(Some("aux")), "\"aux\".sqlite_master");
    }

    #[test]
    fn test_validate_alias() {
        assert!(validate_alias("aux").is_ok());
        assert!(validate_alias("_shard2").is_ok());
        assert!(validate_alias("").is_err());
        assert!(validate_alias("2aux").is_err());
        assert!(validate_alias("a b").is_err());
        assert!(validate_alias("main").is_err());
        assert!(validate_alias("TEMP").is_err());
    }

    #[test]
    fn test_json_path() {
        assert_eq!(json_path("email").unwrap(), "$.email");
        assert_eq!(json_path("profile.name").unwrap(), "$.profile.name");
        assert_eq!(json_path("tags[0]").unwrap(), "$.tags[0]");
        assert!(json_path("").is_err());
        assert!(json_path("a..b").is_err());
        assert!(json_path("a') --").is_err());
        assert!(json_path("a[x]").is_err());
        assert!(json_path("a[1").is_err());
        assert!(json_path("a[1]]").is_err());
        assert!(json_path("a[1]é]").is_err());
        assert!(json_path("a[1]x").is_err());
        assert!(json_path("é[1]").is_err());
        assert_eq!(json_path("grid[1][2]").unwrap(), "$.grid[1][2]");
    }

    #[test]
    fn test_escape_keeps_names_apart() {
        assert_eq!(escape("users"), "users");
        assert_eq!(escape("a_b"), "a__b");
        assert_eq!(escape("a-b"), "a_2db");
        assert_eq!(escape("é"), "_c3_a9");
        assert_eq!(escape(""), "_");
        assert_ne!(collection_table("a-b"), collection_table("a_b"));
        assert_ne!(collection_table("a_2db"), collection_table("a-b"));
    }

    #[test]
    fn test_index_name() {
        assert_eq!(index_name("coll_users", "email"), "idx_coll_users_email");
        assert_eq!(
            index_name("coll_users", "profile.name"),
            "idx_coll_users_profile_name"
        );
    }
}
