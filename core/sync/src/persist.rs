//! Ordered snapshot writes on top of a `SnapshotStore`.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

use txqueue_common::Result;
use txqueue_storage::SnapshotStore;

use crate::store::QueueSnapshot;

/// Writes versioned snapshots, never letting an older one overwrite a newer one.
pub struct Persister {
    store: Arc<dyn SnapshotStore>,
    /// Version of the last snapshot written.
    written: Mutex<u64>,
}

impl Persister {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            written: Mutex::new(0),
        }
    }

    /// Load the last saved snapshot, if any.
    pub async fn load(&self) -> Result<Option<QueueSnapshot>> {
        match self.store.load().await? {
            Some(bytes) => Ok(Some(QueueSnapshot::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write `snapshot`, taken at `version`.
    ///
    /// Writes are serialized. If a newer version has already been written
    /// this one is dropped: the newer snapshot contains its changes.
    pub async fn write(&self, version: u64, snapshot: &QueueSnapshot) -> Result<()> {
        let mut written = self.written.lock().await;
        if version <= *written {
            debug!(
                "Skipping stale snapshot v{} (v{} already written)",
                version, *written
            );
            return Ok(());
        }

        let bytes = snapshot.to_bytes()?;
        if let Err(e) = self.store.save(&bytes).await {
            error!("Failed to persist queue to {}: {}", self.store.name(), e);
            return Err(e);
        }
        *written = version;
        Ok(())
    }
}
