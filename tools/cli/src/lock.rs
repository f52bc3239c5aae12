//! Advisory lock that keeps one writer per queue snapshot.
//!
//! Every command that changes the queue holds the lock for as long as its
//! `TransactionQueue` lives, so two processes never overwrite each other's
//! snapshots. Read-only commands skip it.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Exclusive hold on a queue snapshot, released on drop.
pub struct QueueLock {
    file: File,
}

impl QueueLock {
    /// Lock the snapshot stored at `snapshot`. Fails at once if another
    /// process holds it.
    pub fn acquire(snapshot: &Path) -> Result<Self> {
        let path = lock_path(snapshot);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        // No truncation before the lock is ours: the file names the holder.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            match read_holder(&path) {
                Some(pid) => bail!(
                    "Queue {} is in use by process {}",
                    snapshot.display(),
                    pid
                ),
                None => bail!("Queue {} is in use by another process", snapshot.display()),
            }
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(Self { file })
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_path(snapshot: &Path) -> PathBuf {
    let mut name = snapshot.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn read_holder(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}
