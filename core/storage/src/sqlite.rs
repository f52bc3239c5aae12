//! SQLite-backed snapshot store.
//!
//! Keeps each snapshot as a single row keyed by queue name, so several
//! queues can share one database file.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::provider::SnapshotStore;
use txqueue_common::{Error, Result};

/// Default row key when a database holds a single queue.
pub const DEFAULT_KEY: &str = "default";

/// Snapshot store using an embedded SQLite database.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    key: String,
}

impl SqliteStore {
    /// Create or open a snapshot database.
    ///
    /// # Arguments
    /// - `db_path`: Path to the SQLite database file
    /// - `key`: Row key for this queue's snapshot
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>, key: impl Into<String>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(storage_err)?;
        Self::init(conn, key.into())
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn, DEFAULT_KEY.to_string())
    }

    fn init(conn: Connection, key: String) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queue_snapshots (
                key TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(storage_err)?;

        info!("Snapshot database opened (key: {})", key);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            key,
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &str) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let key = self.key.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| Error::Storage("Snapshot database lock poisoned".to_string()))?;
            f(&conn, &key).map_err(storage_err)
        })
        .await
        .map_err(|e| Error::Storage(format!("Snapshot task failed: {}", e)))?
    }
}

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn save(&self, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        let len = data.len();

        self.with_conn(move |conn, key| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO queue_snapshots (key, data, updated_at)
                VALUES (?1, ?2, ?3)
                "#,
                params![key, data, Utc::now().to_rfc3339()],
            )
            .map(|_| ())
        })
        .await?;

        debug!("Saved snapshot ({} bytes)", len);
        Ok(())
    }

    async fn load(&self) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn, key| {
            let result = conn.query_row(
                "SELECT data FROM queue_snapshots WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            );

            match result {
                Ok(data) => Ok(Some(data)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }
}
