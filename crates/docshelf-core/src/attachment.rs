//! Attachment of secondary database files
//!
//! An attachment binds another SQLite file into the primary connection's
//! namespace under an alias, after which its tables are addressable as
//! `alias.table`. The manager tracks what it attached so callers can ask
//! for the current aliases, and forgets everything on [`clear`] once the
//! primary connection is closed.
//!
//! [`clear`]: AttachmentManager::clear

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::connection::sqlite::MEMORY_PATH;
use crate::connection::{text, Connection};
use crate::error::{StorageError, StorageResult};
use crate::schema::naming::validate_alias;

/// One configured attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentConfig {
    /// Database file, or `:memory:`
    pub path: PathBuf,
    pub alias: String,
    /// Create an empty file (and its directory) when missing
    #[serde(default)]
    pub create_if_not_exists: bool,
}

impl AttachmentConfig {
    pub fn new(path: impl Into<PathBuf>, alias: &str) -> Self {
        Self {
            path: path.into(),
            alias: alias.to_string(),
            create_if_not_exists: false,
        }
    }

    pub fn create_if_not_exists(mut self, create: bool) -> Self {
        self.create_if_not_exists = create;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attached {
    alias: String,
    path: String,
}

/// Tracks the attachments of one primary connection
#[derive(Debug, Default)]
pub struct AttachmentManager {
    /// In attach order
    attached: Vec<Attached>,
}

impl AttachmentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `path` under `alias`
    ///
    /// A missing file is an error unless `create_if_not_exists` is set, in
    /// which case an empty file is created first. Attaching an alias again
    /// with the same path does nothing.
    pub fn attach(
        &mut self,
        conn: &dyn Connection,
        path: impl AsRef<Path>,
        alias: &str,
        create_if_not_exists: bool,
    ) -> StorageResult<()> {
        validate_alias(alias)?;
        let path = path.as_ref();
        let resolved = path.to_string_lossy().into_owned();

        if let Some(existing) = self.find(alias) {
            if existing.path == resolved {
                debug!("Alias '{}' already attached to {}", alias, resolved);
                return Ok(());
            }
            return Err(StorageError::Attachment {
                alias: alias.to_string(),
                reason: format!("already attached to '{}'", existing.path),
            });
        }

        if resolved != MEMORY_PATH {
            prepare_file(path, alias, create_if_not_exists)?;
        }

        conn.execute("ATTACH DATABASE ? AS ?", &[text(&resolved), text(alias)])
            .map_err(|e| StorageError::Attachment {
                alias: alias.to_string(),
                reason: e.to_string(),
            })?;

        info!("Attached {} as '{}'", resolved, alias);
        self.attached.push(Attached {
            alias: alias.to_string(),
            path: resolved,
        });
        Ok(())
    }

    /// Attach one configured attachment
    pub fn attach_config(&mut self, conn: &dyn Connection, config: &AttachmentConfig) -> StorageResult<()> {
        self.attach(conn, &config.path, &config.alias, config.create_if_not_exists)
    }

    /// Attach each configuration in order, stopping at the first failure
    ///
    /// Attachments made before the failure stay attached.
    pub fn attach_all(&mut self, conn: &dyn Connection, configs: &[AttachmentConfig]) -> StorageResult<()> {
        for config in configs {
            self.attach_config(conn, config)?;
        }
        Ok(())
    }

    /// Detach `alias`; unknown aliases are ignored
    pub fn detach(&mut self, conn: &dyn Connection, alias: &str) -> StorageResult<()> {
        let Some(position) = self.attached.iter().position(|a| a.alias == alias) else {
            debug!("Alias '{}' is not attached, nothing to detach", alias);
            return Ok(());
        };

        conn.execute("DETACH DATABASE ?", &[text(alias)])
            .map_err(|e| StorageError::Attachment {
                alias: alias.to_string(),
                reason: e.to_string(),
            })?;

        self.attached.remove(position);
        info!("Detached '{}'", alias);
        Ok(())
    }

    /// Detach everything, most recent first
    pub fn detach_all(&mut self, conn: &dyn Connection) -> StorageResult<()> {
        let aliases: Vec<String> = self.attached.iter().rev().map(|a| a.alias.clone()).collect();
        for alias in aliases {
            self.detach(conn, &alias)?;
        }
        Ok(())
    }

    pub fn is_attached(&self, alias: &str) -> bool {
        self.find(alias).is_some()
    }

    /// Attached aliases in attach order
    pub fn list_aliases(&self) -> Vec<&str> {
        self.attached.iter().map(|a| a.alias.as_str()).collect()
    }

    /// Path an alias is attached to
    pub fn path_of(&self, alias: &str) -> Option<&str> {
        self.find(alias).map(|a| a.path.as_str())
    }

    /// Forget every attachment without issuing statements
    ///
    /// Closing the primary connection drops its attachments, so this is
    /// all that is left to do after a disconnect.
    pub fn clear(&mut self) {
        self.attached.clear();
    }

    fn find(&self, alias: &str) -> Option<&Attached> {
        self.attached.iter().find(|a| a.alias == alias)
    }
}

/// Make sure the file exists before attaching it
fn prepare_file(path: &Path, alias: &str, create_if_not_exists: bool) -> StorageResult<()> {
    if path.exists() {
        return Ok(());
    }
    if !create_if_not_exists {
        return Err(StorageError::AttachmentFileMissing {
            alias: alias.to_string(),
            path: path.to_path_buf(),
        });
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| StorageError::from_io(e, parent))?;
    }
    fs::File::create(path).map_err(|e| StorageError::from_io(e, path))?;
    debug!("Created empty database file {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SqliteConnection;
    use tempfile::TempDir;

    fn database_names(conn: &SqliteConnection) -> Vec<String> {
        conn.query_all("PRAGMA database_list", &[])
            .unwrap()
            .iter()
            .map(|row| row.text("name").unwrap())
            .collect()
    }

    #[test]
    fn test_missing_file_fails_before_attaching() {
        let dir = TempDir::new().unwrap();
        let conn = SqliteConnection::open_in_memory().unwrap();
        let mut manager = AttachmentManager::new();

        let missing = dir.path().join("nope.db");
        let err = manager.attach(&conn, &missing, "aux", false).unwrap_err();
        assert!(matches!(err, StorageError::AttachmentFileMissing { .. }));
        assert!(!missing.exists());
        assert!(!manager.is_attached("aux"));
        assert_eq!(database_names(&conn), vec!["main"]);

        // The primary connection is still usable
        conn.execute_batch("CREATE TABLE t (x)").unwrap();
    }

    #[test]
    fn test_create_if_not_exists() {
        let dir = TempDir::new().unwrap();
        let conn = SqliteConnection::open_in_memory().unwrap();
        let mut manager = AttachmentManager::new();

        let path = dir.path().join("nested").join("aux.db");
        manager.attach(&conn, &path, "aux", true).unwrap();
        assert!(path.exists());
        assert!(manager.is_attached("aux"));
        assert_eq!(manager.path_of("aux"), path.to_str());
        assert_eq!(database_names(&conn), vec!["main", "aux"]);

        conn.execute_batch("CREATE TABLE aux.t (x)").unwrap();
    }

    #[test]
    fn test_memory_path_passes_through() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        let mut manager = AttachmentManager::new();

        manager.attach(&conn, MEMORY_PATH, "scratch", false).unwrap();
        assert_eq!(manager.list_aliases(), vec!["scratch"]);
        assert!(!Path::new(MEMORY_PATH).exists());
    }

    #[test]
    fn test_reattach_and_detach() {
        let dir = TempDir::new().unwrap();
        let conn = SqliteConnection::open_in_memory().unwrap();
        let mut manager = AttachmentManager::new();

        let first = dir.path().join("a.db");
        let second = dir.path().join("b.db");
        manager.attach(&conn, &first, "aux", true).unwrap();
        manager.attach(&conn, &first, "aux", true).unwrap();

        let err = manager.attach(&conn, &second, "aux", true).unwrap_err();
        assert!(matches!(err, StorageError::Attachment { .. }));

        manager.detach(&conn, "aux").unwrap();
        manager.detach(&conn, "aux").unwrap();
        manager.detach(&conn, "never").unwrap();
        assert!(manager.list_aliases().is_empty());
        assert_eq!(database_names(&conn), vec!["main"]);
    }

    #[test]
    fn test_attach_all_in_order() {
        let dir = TempDir::new().unwrap();
        let conn = SqliteConnection::open_in_memory().unwrap();
        let mut manager = AttachmentManager::new();

        let configs = vec![
            AttachmentConfig::new(dir.path().join("one.db"), "one").create_if_not_exists(true),
            AttachmentConfig::new(dir.path().join("two.db"), "two").create_if_not_exists(true),
            AttachmentConfig::new(dir.path().join("missing.db"), "three"),
            AttachmentConfig::new(dir.path().join("four.db"), "four").create_if_not_exists(true),
        ];
        let err = manager.attach_all(&conn, &configs).unwrap_err();
        assert!(matches!(err, StorageError::AttachmentFileMissing { .. }));
        assert_eq!(manager.list_aliases(), vec!["one", "two"]);

        manager.detach_all(&conn).unwrap();
        assert_eq!(database_names(&conn), vec!["main"]);
    }

    #[test]
    fn test_invalid_alias() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        let mut manager = AttachmentManager::new();
        for alias in ["main", "temp", "", "x y", "a;b"] {
            let err = manager.attach(&conn, MEMORY_PATH, alias, true).unwrap_err();
            assert!(matches!(err, StorageError::Validation(_)), "{}", alias);
        }
    }

    #[test]
    fn test_clear_after_disconnect() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let mut manager = AttachmentManager::new();
        manager.attach(&conn, MEMORY_PATH, "scratch", false).unwrap();

        conn.disconnect().unwrap();
        manager.clear();
        assert!(!manager.is_attached("scratch"));

        conn.connect().unwrap();
        assert_eq!(database_names(&conn), vec!["main"]);
    }

    #[test]
    fn test_config_from_toml() {
        let config: AttachmentConfig = toml::from_str(
            r#"
            path = "/data/aux.db"
            alias = "aux"
            "#,
        )
        .unwrap();
        assert_eq!(config, AttachmentConfig::new("/data/aux.db", "aux"));
    }
}
