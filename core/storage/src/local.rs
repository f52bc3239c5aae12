//! Local filesystem snapshot store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::provider::SnapshotStore;
use txqueue_common::{Error, Result};

/// File header identifying a txqueue snapshot, format version 1.
const MAGIC: &[u8; 4] = b"TXQ1";
const HEADER_LEN: usize = MAGIC.len() + 4;

/// Snapshot store backed by a single file.
///
/// Writes go to a sibling temp file that is synced and then renamed over
/// the target, so a crash mid-write leaves the previous snapshot intact.
/// Every snapshot carries a CRC32 of its payload; a mismatch on load is
/// reported instead of handing corrupt data to the queue.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create a new file store at the given path.
    ///
    /// # Postconditions
    /// - Parent directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied creating the parent directory
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Create parent if it doesn't exist (sync for constructor)
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(Self { path })
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + data.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    fn decode(path: &Path, raw: Vec<u8>) -> Result<Vec<u8>> {
        if raw.len() < HEADER_LEN || &raw[..MAGIC.len()] != MAGIC {
            return Err(Error::Storage(format!(
                "{} is not a txqueue snapshot",
                path.display()
            )));
        }

        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&raw[MAGIC.len()..HEADER_LEN]);
        let expected = u32::from_le_bytes(checksum);
        let payload = raw[HEADER_LEN..].to_vec();

        if crc32fast::hash(&payload) != expected {
            return Err(Error::Storage(format!(
                "Snapshot checksum mismatch in {}",
                path.display()
            )));
        }

        Ok(payload)
    }
}

#[async_trait]
impl SnapshotStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn save(&self, data: &[u8]) -> Result<()> {
        let temp = self.temp_path();

        let mut file = fs::File::create(&temp).await?;
        file.write_all(&Self::encode(data)).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp, &self.path).await?;
        debug!("Wrote snapshot ({} bytes) to {}", data.len(), self.path.display());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path).await {
            Ok(raw) => Self::decode(&self.path, raw).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
