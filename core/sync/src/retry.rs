//! Retry policy: fixed backoff table and the retry/fail decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use txqueue_common::Result;

use crate::transaction::{Transaction, TransactionStatus};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Ascending backoff table, indexed by retry number. Retries past the
    /// end of the table reuse the last entry.
    pub delays_ms: Vec<u64>,
    /// Whether to add +/- 25% jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a retry configuration from a backoff table.
    pub fn new(delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            delays_ms: delays.into_iter().map(|d| d.as_millis() as u64).collect(),
            jitter: false,
        }
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the delay before retry number `retry_count` (1-based).
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        let Some(last) = self.delays_ms.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (retry_count.saturating_sub(1) as usize).min(last);
        let base_delay = self.delays_ms[index] as f64;

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            base_delay * jitter_factor
        } else {
            base_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new([
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(15),
            Duration::from_secs(60),
            Duration::from_secs(300),
        ])
    }
}

/// What happened to a transaction after a recoverable failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Moved to `Retry`; becomes pending again after `delay`.
    Scheduled {
        retry_count: u32,
        delay: Duration,
        due_at: DateTime<Utc>,
    },
    /// Retry budget spent; moved to `Failed`.
    Exhausted { retry_count: u32 },
}

/// Applies the retry policy to failed transactions.
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    /// Create a new retry manager.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Record a recoverable failure on a `Processing` transaction.
    ///
    /// Consumes one retry. Timer scheduling is left to the caller, which
    /// owns the timer service.
    pub fn handle_failure(
        &self,
        tx: &mut Transaction,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision> {
        match tx.record_failure(error)? {
            TransactionStatus::Retry => {
                let delay = self.config.delay_for_attempt(tx.retry_count());
                let due_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
                tx.estimated_sync_time = Some(due_at);

                debug!(
                    "Transaction {} retry {}/{} in {:?}: {}",
                    tx.id,
                    tx.retry_count(),
                    tx.max_retries,
                    delay,
                    error
                );
                Ok(RetryDecision::Scheduled {
                    retry_count: tx.retry_count(),
                    delay,
                    due_at,
                })
            }
            _ => {
                warn!(
                    "Transaction {} failed after {} retries: {}",
                    tx.id,
                    tx.retry_count(),
                    error
                );
                Ok(RetryDecision::Exhausted {
                    retry_count: tx.retry_count(),
                })
            }
        }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}
