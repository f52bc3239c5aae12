//! Common types used throughout txqueue.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a queued transaction.
///
/// Assigned once at enqueue time and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    const MAX_LENGTH: usize = 128;

    /// Create a TransactionId from an existing string.
    ///
    /// # Preconditions
    /// - `id` must be non-empty after trimming
    /// - `id` must not exceed 128 bytes or contain control characters
    ///
    /// # Errors
    /// - Returns error if id is invalid
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "TransactionId cannot be empty".to_string(),
            ));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(crate::Error::InvalidInput(format!(
                "TransactionId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if id.chars().any(|c| c.is_control()) {
            return Err(crate::Error::InvalidInput(
                "TransactionId contains control characters".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TransactionId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}
