//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use docshelf_core::{Inventory, Record, Version};
use serde_json::{json, Value};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print a single record
    pub fn print_record(&self, record: &Record) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:      {}", record.id);
                if let Some(collection) = record.collection() {
                    println!("Store:   {}", collection);
                }
                println!("Payload: {:#}", Value::Object(record.payload.clone()));
            }
            OutputFormat::Json => {
                println!("{:#}", record_json(record));
            }
            OutputFormat::Quiet => {
                println!("{}", record.id);
            }
        }
    }

    /// Print the inventory, one line per tracked document
    pub fn print_inventory(&self, inventory: &Inventory) {
        match self.format {
            OutputFormat::Human => {
                if inventory.is_empty() {
                    println!("Inventory is empty.");
                    return;
                }
                for (collection, docs) in &inventory.collections {
                    for (doc_id, entry) in docs {
                        let pending = if entry.has_pending_ops { " (pending)" } else { "" };
                        println!(
                            "{} | {} | v{}{}",
                            collection,
                            doc_id,
                            version_label(&entry.version),
                            pending
                        );
                    }
                }
                println!("\n{} document(s)", inventory.len());
            }
            OutputFormat::Json => {
                let collections: serde_json::Map<String, Value> = inventory
                    .collections
                    .iter()
                    .map(|(collection, docs)| {
                        let docs = docs
                            .iter()
                            .map(|(doc_id, entry)| {
                                (
                                    doc_id.clone(),
                                    json!({
                                        "version": version_json(&entry.version),
                                        "hasPendingOps": entry.has_pending_ops,
                                        "updatedAt": entry.updated_at,
                                    }),
                                )
                            })
                            .collect();
                        (collection.clone(), Value::Object(docs))
                    })
                    .collect();
                println!("{:#}", Value::Object(collections));
            }
            OutputFormat::Quiet => {
                for (collection, docs) in &inventory.collections {
                    for doc_id in docs.keys() {
                        println!("{}/{}", collection, doc_id);
                    }
                }
            }
        }
    }

    /// Print a list of table names
    pub fn print_tables(&self, tables: &[String]) {
        match self.format {
            OutputFormat::Human => {
                if tables.is_empty() {
                    println!("No tables found.");
                    return;
                }
                for table in tables {
                    println!("{}", table);
                }
                println!("\n{} table(s)", tables.len());
            }
            OutputFormat::Json => {
                println!("{:#}", json!(tables));
            }
            OutputFormat::Quiet => {
                for table in tables {
                    println!("{}", table);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn record_json(record: &Record) -> Value {
    json!({
        "id": record.id,
        "payload": Value::Object(record.payload.clone()),
    })
}

fn version_json(version: &Version) -> Value {
    match version {
        Version::Number(n) => json!(n),
        Version::Text(s) => json!(s),
    }
}

fn version_label(version: &Version) -> String {
    match version {
        Version::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
        Version::Number(n) => n.to_string(),
        Version::Text(s) => s.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_version_label() {
        assert_eq!(version_label(&Version::Number(3.0)), "3");
        assert_eq!(version_label(&Version::Number(1.5)), "1.5");
        assert_eq!(version_label(&Version::Text("abc".into())), "abc");
    }

    #[test]
    fn test_record_json() {
        let record = Record::from_value("term/t1", json!({"collection": "term", "v": 1})).unwrap();
        assert_eq!(
            record_json(&record),
            json!({"id": "term/t1", "payload": {"collection": "term", "v": 1}})
        );
    }
}
