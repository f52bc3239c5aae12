//! Remote endpoint contract and concurrent batch submission.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use txqueue_common::{Result, TransactionId};

use crate::transaction::Transaction;

/// Outcome class reported by the remote system of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Success,
    Duplicate,
    Invalid,
}

/// Response to a single submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: SubmitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SubmitResponse {
    pub fn success() -> Self {
        Self {
            status: SubmitStatus::Success,
            message: None,
        }
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self {
            status: SubmitStatus::Duplicate,
            message: Some(message.into()),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: SubmitStatus::Invalid,
            message: Some(message.into()),
        }
    }
}

/// Remote system of record that queued transactions are synced to.
///
/// Implementations own their timeouts. A transport failure (timeout,
/// connection refused, 5xx) is returned as an `Err` and is retried; the
/// three `SubmitStatus` classes are definitive answers.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Submit one transaction.
    async fn submit(&self, transaction: &Transaction) -> Result<SubmitResponse>;
}

/// Outcome of one submission within a batch.
#[derive(Debug)]
pub struct SubmissionOutcome {
    pub id: TransactionId,
    pub result: Result<SubmitResponse>,
    /// Round-trip time of the submission.
    pub elapsed: Duration,
}

/// Submits batches to the remote endpoint.
pub struct BatchProcessor {
    endpoint: Arc<dyn RemoteEndpoint>,
}

impl BatchProcessor {
    /// Create a new batch processor.
    pub fn new(endpoint: Arc<dyn RemoteEndpoint>) -> Self {
        Self { endpoint }
    }

    /// Submit every transaction of the batch concurrently.
    ///
    /// Outcomes are collected independently: a failing submission never
    /// cancels its siblings. Results come back in batch order.
    pub async fn submit_batch(&self, batch: &[Transaction]) -> Vec<SubmissionOutcome> {
        debug!("Submitting batch of {} transactions", batch.len());

        let submissions = batch.iter().map(|tx| {
            let endpoint = self.endpoint.clone();
            async move {
                let start = Instant::now();
                let result = endpoint.submit(tx).await;
                SubmissionOutcome {
                    id: tx.id.clone(),
                    result,
                    elapsed: start.elapsed(),
                }
            }
        });

        join_all(submissions).await
    }
}
