//! Snapshot store trait definition.

use async_trait::async_trait;

use txqueue_common::Result;

/// Durable backend holding the latest queue snapshot.
///
/// The snapshot is opaque bytes; encoding is the caller's concern.
/// Implementations must make `save` atomic with respect to `load`: a
/// concurrent or crashed save must never leave a half-written snapshot
/// visible.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "file", "sqlite").
    fn name(&self) -> &str;

    /// Replace the stored snapshot.
    ///
    /// # Postconditions
    /// - A subsequent `load` returns exactly `data`
    ///
    /// # Errors
    /// - I/O or database errors
    async fn save(&self, data: &[u8]) -> Result<()>;

    /// Load the stored snapshot, if one has ever been saved.
    ///
    /// # Errors
    /// - I/O or database errors
    /// - Corrupted snapshot (backends that can detect it)
    async fn load(&self) -> Result<Option<Vec<u8>>>;
}
