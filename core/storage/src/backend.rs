//! Opening a snapshot backend by name.

use serde_json::Value;
use std::sync::Arc;

use crate::local::FileStore;
use crate::memory::MemoryStore;
use crate::provider::SnapshotStore;
use crate::sqlite::{SqliteStore, DEFAULT_KEY};
use txqueue_common::{Error, Result};

/// Backend names understood by `open_store`.
pub const STORE_KINDS: &[&str] = &["file", "memory", "sqlite"];

/// Open the backend called `kind`.
///
/// - `memory`: no configuration
/// - `file`: `{"path": "<snapshot file>"}`
/// - `sqlite`: `{"path": "<database file>", "key": "<optional row key>"}`
///
/// # Errors
/// - `Error::NotFound` for an unknown backend
/// - `Error::InvalidInput` if the configuration lacks a required field
/// - whatever the backend reports while opening
pub fn open_store(kind: &str, config: &Value) -> Result<Arc<dyn SnapshotStore>> {
    match kind {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "file" => {
            let path = required_path(config, kind)?;
            Ok(Arc::new(FileStore::new(path)?))
        }
        "sqlite" => {
            let path = required_path(config, kind)?;
            let key = config
                .get("key")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_KEY);
            Ok(Arc::new(SqliteStore::open(path, key)?))
        }
        other => Err(Error::NotFound(format!(
            "Unknown store '{}'. Available: {}",
            other,
            STORE_KINDS.join(", ")
        ))),
    }
}

fn required_path<'a>(config: &'a Value, kind: &str) -> Result<&'a str> {
    config
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidInput(format!("{} store requires 'path'", kind)))
}
