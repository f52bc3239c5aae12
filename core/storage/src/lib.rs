//! Durable snapshot storage for txqueue.
//!
//! The sync queue persists its whole state as one opaque snapshot. This
//! crate provides a trait-based interface for the backends that hold that
//! snapshot (memory, local file, SQLite) and a way to open a backend by
//! name and configuration.
//!
//! # Design Principles
//! - Medium isolation: the queue never knows where its snapshot lives
//! - Async operations: all I/O is async, blocking backends run off the runtime
//! - Whole-snapshot writes: a save replaces the previous snapshot atomically

pub mod backend;
pub mod local;
pub mod memory;
pub mod provider;
pub mod sqlite;

pub use backend::{open_store, STORE_KINDS};
pub use local::FileStore;
pub use memory::MemoryStore;
pub use provider::SnapshotStore;
pub use sqlite::SqliteStore;
