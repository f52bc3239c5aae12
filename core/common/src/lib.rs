//! Common utilities and types shared across txqueue modules.
//!
//! This module provides the error type and identifiers used by the storage
//! backends, the sync queue and the CLI.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::TransactionId;
