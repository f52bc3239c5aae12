//! In-memory snapshot store for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::provider::SnapshotStore;
use txqueue_common::Result;

/// In-memory snapshot store.
///
/// Useful for testing and development. The snapshot is lost on drop.
pub struct MemoryStore {
    snapshot: RwLock<Option<Vec<u8>>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(None),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of completed saves, for asserting write-through behavior.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save(&self, data: &[u8]) -> Result<()> {
        *self.snapshot.write().await = Some(data.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshot.read().await.clone())
    }
}
