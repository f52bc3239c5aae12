//! Classification of remote outcomes into resolutions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use txqueue_common::{Result, TransactionId};

use crate::processor::{SubmitResponse, SubmitStatus};

/// How `invalid` responses are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidPolicy {
    /// Reject immediately: record a conflict and fail the transaction.
    #[default]
    FailFast,
    /// Treat like a transport error and spend retry budget on it.
    Retry,
}

/// Kind of non-success outcome reported by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// The remote already has this transaction.
    Duplicate,
    /// The remote refused the payload.
    Invalid,
}

/// What the queue did about a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Accept the remote copy as ours; the transaction counts as synced.
    Merge,
    /// Give up on the transaction.
    Reject,
}

/// Information about a detected conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub transaction_id: TransactionId,
    pub conflict_type: ConflictType,
    pub resolution: ResolutionStrategy,
    pub details: Option<String>,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    fn new(
        transaction_id: &TransactionId,
        conflict_type: ConflictType,
        resolution: ResolutionStrategy,
        details: Option<String>,
    ) -> Self {
        Self {
            transaction_id: transaction_id.clone(),
            conflict_type,
            resolution,
            details,
            detected_at: Utc::now(),
        }
    }
}

/// Result of classifying one submission outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Accepted by the remote side.
    Completed,
    /// Duplicate merged; synced without being retried.
    Merged(ConflictRecord),
    /// Rejected without retry.
    Rejected(ConflictRecord),
    /// Recoverable; hand to the retry manager.
    Retry { error: String },
    /// The submission could not be made at all and never will be.
    Failed { error: String },
}

/// Conflict classifier.
pub struct ConflictResolver {
    invalid_policy: InvalidPolicy,
}

impl ConflictResolver {
    /// Create a new conflict resolver.
    pub fn new(invalid_policy: InvalidPolicy) -> Self {
        Self { invalid_policy }
    }

    /// Get the invalid-response policy.
    pub fn invalid_policy(&self) -> InvalidPolicy {
        self.invalid_policy
    }

    /// Classify the outcome of submitting transaction `id`.
    pub fn resolve(&self, id: &TransactionId, outcome: Result<SubmitResponse>) -> Resolution {
        let response = match outcome {
            Ok(response) => response,
            Err(err) if err.is_transient() => {
                return Resolution::Retry {
                    error: err.to_string(),
                }
            }
            Err(err) => {
                return Resolution::Failed {
                    error: err.to_string(),
                }
            }
        };

        match response.status {
            SubmitStatus::Success => Resolution::Completed,
            SubmitStatus::Duplicate => Resolution::Merged(ConflictRecord::new(
                id,
                ConflictType::Duplicate,
                ResolutionStrategy::Merge,
                response.message,
            )),
            SubmitStatus::Invalid => match self.invalid_policy {
                InvalidPolicy::FailFast => Resolution::Rejected(ConflictRecord::new(
                    id,
                    ConflictType::Invalid,
                    ResolutionStrategy::Reject,
                    response.message,
                )),
                InvalidPolicy::Retry => Resolution::Retry {
                    error: response
                        .message
                        .unwrap_or_else(|| "Rejected as invalid by remote".to_string()),
                },
            },
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(InvalidPolicy::default())
    }
}
