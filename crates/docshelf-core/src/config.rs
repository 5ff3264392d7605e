//! Store configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/docshelf/config.toml)
//! 3. Environment variables (DOCSHELF_* prefix)
//!
//! Environment variables take precedence over config file values.
//!
//! ## Example
//!
//! ```toml
//! database = "docs.db"
//!
//! [schema]
//! strategy = "attached_collection_table"
//! attachment_alias = "aux"
//!
//! [[attachments]]
//! path = "/var/lib/docshelf/aux.db"
//! alias = "aux"
//! create_if_not_exists = true
//!
//! [collections.users]
//! indexes = ["email"]
//! encrypted_fields = ["ssn"]
//!
//! [[projections]]
//! name = "term_tags"
//! collection = "term"
//! array_path = "tags"
//! columns = ["label"]
//!
//! [retry]
//! max_retries = 8
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::attachment::AttachmentConfig;
use crate::connection::sqlite::MEMORY_PATH;
use crate::connection::RetryPolicy;
use crate::encryption::Encryption;
use crate::schema::{CollectionSchema, ProjectionConfig, SchemaOptions, StrategyKind};

/// Environment variable prefix
const ENV_PREFIX: &str = "DOCSHELF";

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the primary database file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Primary database file, relative to `data_dir`, or `:memory:`
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub schema: SchemaConfig,

    /// Secondary databases, attached in this order
    #[serde(default)]
    pub attachments: Vec<AttachmentConfig>,

    /// Per-collection indexes and encrypted fields
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionSchema>,

    #[serde(default)]
    pub projections: Vec<ProjectionConfig>,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Layout selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Table name prefix for the single-table layout
    #[serde(default)]
    pub table_prefix: String,

    /// Alias holding the tables of the attached layout
    #[serde(default)]
    pub attachment_alias: Option<String>,
}

/// Busy/locked retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: default_database(),
            schema: SchemaConfig::default(),
            attachments: Vec::new(),
            collections: BTreeMap::new(),
            projections: Vec::new(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (DOCSHELF_DATA_DIR, DOCSHELF_DATABASE, DOCSHELF_STRATEGY)
    /// 2. Config file (~/.config/docshelf/config.toml or DOCSHELF_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        // DOCSHELF_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // DOCSHELF_DATABASE
        if let Ok(val) = std::env::var(format!("{}_DATABASE", ENV_PREFIX)) {
            if !val.is_empty() {
                self.database = val;
            }
        }

        // DOCSHELF_STRATEGY
        if let Ok(val) = std::env::var(format!("{}_STRATEGY", ENV_PREFIX)) {
            self.schema.strategy = val
                .parse()
                .with_context(|| format!("Invalid {}_STRATEGY", ENV_PREFIX))?;
        }
        Ok(())
    }

    /// Reject combinations that cannot open
    pub fn validate(&self) -> Result<()> {
        if self.database.is_empty() {
            bail!("database must not be empty");
        }

        let mut aliases = Vec::new();
        for attachment in &self.attachments {
            if aliases.contains(&attachment.alias.as_str()) {
                bail!("attachment alias '{}' is configured twice", attachment.alias);
            }
            aliases.push(attachment.alias.as_str());
        }

        if self.schema.strategy == StrategyKind::AttachedCollectionTable {
            let Some(alias) = self.schema.attachment_alias.as_deref() else {
                bail!("schema.attachment_alias is required for the attached_collection_table strategy");
            };
            if !aliases.contains(&alias) {
                bail!("schema.attachment_alias '{}' has no matching [[attachments]] entry", alias);
            }
        }

        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            bail!("retry.initial_delay_ms must not exceed retry.max_delay_ms");
        }
        Ok(())
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if self.database != MEMORY_PATH && !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with DOCSHELF_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docshelf")
            .join("config.toml")
    }

    /// Get the path to the primary database
    pub fn database_path(&self) -> PathBuf {
        if self.database == MEMORY_PATH {
            return PathBuf::from(MEMORY_PATH);
        }
        // join keeps absolute paths as they are
        self.data_dir.join(&self.database)
    }

    /// Schema options for the configured collections and projections
    ///
    /// Collections listing `encrypted_fields` switch `encryption` to
    /// field-level mode for that collection; without `encryption` the
    /// field lists have no effect.
    pub fn schema_options(&self, encryption: Option<Encryption>) -> SchemaOptions {
        let encryption = encryption.map(|enc| {
            self.collections
                .iter()
                .filter(|(_, schema)| !schema.encrypted_fields.is_empty())
                .fold(enc, |enc, (name, schema)| {
                    enc.with_encrypted_fields(name, schema.encrypted_fields.iter().cloned())
                })
        });

        SchemaOptions {
            collections: self.collections.clone(),
            projections: self.projections.clone(),
            encryption,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docshelf")
}

fn default_database() -> String {
    "docshelf.db".to_string()
}

fn default_max_retries() -> u32 {
    RetryPolicy::default().max_retries
}

fn default_initial_delay_ms() -> u64 {
    RetryPolicy::default().initial_delay.as_millis() as u64
}

fn default_max_delay_ms() -> u64 {
    RetryPolicy::default().max_delay.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            // Clear all the vars
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "DOCSHELF_DATA_DIR",
        "DOCSHELF_DATABASE",
        "DOCSHELF_STRATEGY",
        "DOCSHELF_CONFIG",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.schema.strategy, StrategyKind::CollectionTable);
        assert!(config.attachments.is_empty());
        assert!(config.data_dir.ends_with("docshelf"));
        assert!(config.database_path().ends_with("docshelf.db"));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_memory_database_path() {
        let config = Config {
            database: MEMORY_PATH.to_string(),
            ..Config::default()
        };
        assert_eq!(config.database_path(), PathBuf::from(":memory:"));
    }

    #[test]
    fn test_env_overrides() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("DOCSHELF_DATA_DIR", "/tmp/docshelf-test");
        env::set_var("DOCSHELF_DATABASE", "other.db");
        env::set_var("DOCSHELF_STRATEGY", "single_table");
        config.apply_env_overrides().unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/docshelf-test"));
        assert_eq!(config.database_path(), PathBuf::from("/tmp/docshelf-test/other.db"));
        assert_eq!(config.schema.strategy, StrategyKind::SingleTable);

        env::set_var("DOCSHELF_STRATEGY", "sharded");
        assert!(config.apply_env_overrides().is_err());
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            database = "app.db"

            [schema]
            strategy = "attached_collection_table"
            attachment_alias = "aux"

            [[attachments]]
            path = "/custom/aux.db"
            alias = "aux"
            create_if_not_exists = true

            [collections.users]
            indexes = ["email", "profile.name"]
            encrypted_fields = ["ssn"]

            [[projections]]
            name = "term_tags"
            collection = "term"
            array_path = "tags"

            [retry]
            max_retries = 2
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.database_path(), PathBuf::from("/custom/data/app.db"));
        assert_eq!(config.schema.strategy, StrategyKind::AttachedCollectionTable);
        assert_eq!(config.attachments.len(), 1);
        assert!(config.attachments[0].create_if_not_exists);
        assert_eq!(config.collections["users"].indexes, vec!["email", "profile.name"]);
        assert_eq!(config.projections[0].primary_key, "id");
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.initial_delay_ms, 20);
    }

    #[test]
    fn test_validation() {
        let _guard = EnvGuard::new(ENV_VARS);

        let missing_alias = r#"
            [schema]
            strategy = "attached_collection_table"
        "#;
        assert!(Config::load_from_str(missing_alias).is_err());

        let unknown_alias = r#"
            [schema]
            strategy = "attached_collection_table"
            attachment_alias = "aux"
        "#;
        assert!(Config::load_from_str(unknown_alias).is_err());

        let duplicate = r#"
            [[attachments]]
            path = "a.db"
            alias = "aux"

            [[attachments]]
            path = "b.db"
            alias = "aux"
        "#;
        assert!(Config::load_from_str(duplicate).is_err());

        let bad_retry = r#"
            [retry]
            initial_delay_ms = 5000
            max_delay_ms = 10
        "#;
        assert!(Config::load_from_str(bad_retry).is_err());
    }

    #[test]
    fn test_schema_options_enable_field_encryption() {
        let mut config = Config::default();
        config.collections.insert(
            "users".to_string(),
            CollectionSchema {
                indexes: vec!["email".to_string()],
                encrypted_fields: vec!["ssn".to_string()],
            },
        );

        let plain = config.schema_options(None);
        assert!(plain.encryption.is_none());
        assert_eq!(plain.indexes("users"), ["email".to_string()]);

        let encryption = Encryption::new(|s| s.to_string(), |s| s.to_string());
        let options = config.schema_options(Some(encryption));
        let enc = options.encryption.unwrap();
        assert_eq!(enc.encrypted_fields("users"), Some(&["ssn".to_string()][..]));
        assert_eq!(enc.encrypted_fields("posts"), None);
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config {
            data_dir: dir.path().join("data"),
            ..Config::default()
        };
        config.schema.strategy = StrategyKind::SingleTable;
        config.schema.table_prefix = "app_".to_string();
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(config.data_dir.exists());
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = tempfile::TempDir::new().unwrap();
        env::set_var("DOCSHELF_DATA_DIR", dir.path().join("data"));

        let config = Config::load_from_path(&dir.path().join("nope.toml")).unwrap();
        // Should return defaults when file doesn't exist
        assert_eq!(config.schema, SchemaConfig::default());
        assert!(config.data_dir.exists());
    }
}
