//! Transaction records and their status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use txqueue_common::{Error, Result, TransactionId};

/// Kind of state-changing operation a transaction carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Payment,
    Refund,
    Void,
    Capture,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Payment => "payment",
            TransactionKind::Refund => "refund",
            TransactionKind::Void => "void",
            TransactionKind::Capture => "capture",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "payment" => Ok(TransactionKind::Payment),
            "refund" => Ok(TransactionKind::Refund),
            "void" => Ok(TransactionKind::Void),
            "capture" => Ok(TransactionKind::Capture),
            other => Err(Error::InvalidInput(format!(
                "Unknown transaction kind '{}'",
                other
            ))),
        }
    }
}

/// Scheduling priority. Ordering is `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(Error::InvalidInput(format!("Unknown priority '{}'", other))),
        }
    }
}

/// Sync status of a queued transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Waiting to be picked up by a sync cycle.
    Pending,
    /// Submitted to the remote endpoint, outcome not yet known.
    Processing,
    /// Failed recoverably, waiting for its backoff to elapse.
    Retry,
    /// Accepted by the remote endpoint.
    Completed,
    /// Gave up. Never retried again.
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Retry => "retry",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    /// Completed and failed transactions never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Retry)
                | (Processing, Failed)
                | (Retry, Pending)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "processing" => Ok(TransactionStatus::Processing),
            "retry" => Ok(TransactionStatus::Retry),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown status '{}'", other))),
        }
    }
}

/// A queued unit of work awaiting confirmation by the remote system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub kind: TransactionKind,
    /// Opaque domain data, only interpreted by validators and the endpoint.
    pub payload: serde_json::Value,
    pub priority: Priority,
    status: TransactionStatus,
    retry_count: u32,
    pub max_retries: u32,
    pub depends_on: BTreeSet<TransactionId>,
    pub tags: BTreeSet<String>,
    /// Creation time. FIFO tiebreak within a priority class.
    pub timestamp: DateTime<Utc>,
    pub last_error: Option<String>,
    /// When the scheduled retry is due, while in `Retry`.
    pub estimated_sync_time: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Build a pending transaction from enqueue input.
    pub fn new(id: TransactionId, request: NewTransaction, default_max_retries: u32) -> Self {
        Self {
            id,
            kind: request.kind,
            payload: request.payload,
            priority: request.priority,
            status: TransactionStatus::Pending,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            depends_on: request.depends_on,
            tags: request.tags,
            timestamp: Utc::now(),
            last_error: None,
            estimated_sync_time: None,
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Move along a state machine edge.
    ///
    /// # Errors
    /// - `Error::InvalidTransition` if `next` is not reachable from the
    ///   current status
    pub fn transition(&mut self, next: TransactionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark as submitted.
    pub fn mark_processing(&mut self) -> Result<()> {
        self.transition(TransactionStatus::Processing)
    }

    /// Mark as accepted by the remote side.
    pub fn mark_completed(&mut self) -> Result<()> {
        self.transition(TransactionStatus::Completed)?;
        self.last_error = None;
        self.estimated_sync_time = None;
        Ok(())
    }

    /// Record a recoverable failure and consume one retry.
    ///
    /// Returns the new status: `Retry` while budget remains, `Failed` once
    /// `retry_count` reaches `max_retries`. The count is clamped so it never
    /// exceeds `max_retries`.
    pub fn record_failure(&mut self, error: impl Into<String>) -> Result<TransactionStatus> {
        let next_count = self.retry_count.saturating_add(1);
        let next = if next_count >= self.max_retries {
            TransactionStatus::Failed
        } else {
            TransactionStatus::Retry
        };

        self.transition(next)?;
        self.retry_count = next_count.min(self.max_retries);
        self.last_error = Some(error.into());
        if next == TransactionStatus::Failed {
            self.estimated_sync_time = None;
        }
        Ok(next)
    }

    /// Fail immediately without touching the retry budget.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(TransactionStatus::Failed)?;
        self.last_error = Some(error.into());
        self.estimated_sync_time = None;
        Ok(())
    }

    /// Backoff elapsed, eligible for scheduling again.
    pub fn mark_requeued(&mut self) -> Result<()> {
        self.transition(TransactionStatus::Pending)?;
        self.estimated_sync_time = None;
        Ok(())
    }

    /// Whether a `Retry` transaction's backoff has already run out.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TransactionStatus::Retry
            && self.estimated_sync_time.map_or(true, |due| due <= now)
    }

    /// Put a transaction found in `Processing` at load time back in line.
    ///
    /// The submission it was waiting on died with the previous process, so
    /// the outcome is unknown. It moves to `Retry` with its backoff already
    /// elapsed and without spending retry budget.
    pub fn recover_interrupted(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TransactionStatus::Retry)?;
        self.last_error = Some("Interrupted before the remote outcome was known".to_string());
        self.estimated_sync_time = Some(now);
        Ok(())
    }

    /// Whether this transaction carries any of `tags`.
    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|t| self.tags.contains(t))
    }
}

/// Input for `enqueue`: everything except id, status and retry state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub kind: TransactionKind,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    /// Defaults to the queue's configured retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub depends_on: BTreeSet<TransactionId>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl NewTransaction {
    /// Create enqueue input with default priority and no dependencies.
    pub fn new(kind: TransactionKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            priority: Priority::Normal,
            max_retries: None,
            depends_on: BTreeSet::new(),
            tags: BTreeSet::new(),
        }
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Require `id` to complete first.
    pub fn depends_on(mut self, id: TransactionId) -> Self {
        self.depends_on.insert(id);
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Criteria for `list`. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionFilter {
    pub status: Option<TransactionStatus>,
    pub kind: Option<TransactionKind>,
    pub priority: Option<Priority>,
    /// Matches transactions carrying any of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.status.map_or(true, |s| tx.status() == s)
            && self.kind.map_or(true, |k| tx.kind == k)
            && self.priority.map_or(true, |p| tx.priority == p)
            && (self.tags.is_empty() || tx.has_any_tag(&self.tags))
    }
}
