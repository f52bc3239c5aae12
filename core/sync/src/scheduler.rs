//! Dependency-aware batch planning and stall detection.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

use txqueue_common::TransactionId;

use crate::store::QueueStore;
use crate::transaction::{Transaction, TransactionStatus};

/// Why a transaction can never be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "dependency", rename_all = "snake_case")]
pub enum StallReason {
    /// A dependency (possibly transitive) ended up failed.
    FailedDependency(TransactionId),
    /// A dependency is not in the queue (never enqueued, removed or cleaned).
    MissingDependency(TransactionId),
    /// The dependency graph loops back on itself.
    DependencyCycle,
}

impl fmt::Display for StallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StallReason::FailedDependency(id) => write!(f, "dependency {} failed", id),
            StallReason::MissingDependency(id) => write!(f, "dependency {} is missing", id),
            StallReason::DependencyCycle => f.write_str("dependency cycle"),
        }
    }
}

/// Batches for one sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    /// Ordered batches. A batch only depends on completed transactions and
    /// on members of earlier batches.
    pub batches: Vec<Vec<TransactionId>>,
    /// Candidates that could not be placed this cycle.
    pub blocked: Vec<TransactionId>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn scheduled(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

/// Plans sync batches from the queue contents.
#[derive(Debug, Clone)]
pub struct DependencyScheduler {
    batch_size: usize,
}

impl DependencyScheduler {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether a transaction is eligible for this cycle, ignoring dependencies.
    pub fn is_candidate(tx: &Transaction, now: DateTime<Utc>) -> bool {
        tx.status() == TransactionStatus::Pending || tx.retry_due(now)
    }

    /// Whether every dependency of `tx` has completed.
    pub fn dependencies_met(tx: &Transaction, store: &QueueStore) -> bool {
        tx.depends_on.iter().all(|dep| {
            store
                .get(dep)
                .is_some_and(|d| d.status() == TransactionStatus::Completed)
        })
    }

    /// Split the ready transactions into ordered batches.
    ///
    /// Each pass over the unplaced candidates fills one batch, in priority
    /// then age order, with those whose dependencies are completed or sit in
    /// an earlier batch. Planning stops at the first pass that places
    /// nothing, so broken or cyclic graphs terminate.
    pub fn plan(&self, store: &QueueStore, now: DateTime<Utc>) -> SyncPlan {
        let mut candidates: Vec<&Transaction> = store
            .iter()
            .filter(|tx| Self::is_candidate(tx, now))
            .collect();
        candidates.sort_by_key(|tx| (Reverse(tx.priority), tx.timestamp, tx.id.clone()));

        let mut placed: HashSet<&TransactionId> = HashSet::new();
        let mut batches = Vec::new();

        loop {
            let mut batch: Vec<&TransactionId> = Vec::new();
            for tx in &candidates {
                if batch.len() == self.batch_size {
                    break;
                }
                if placed.contains(&tx.id) {
                    continue;
                }
                let ready = tx.depends_on.iter().all(|dep| {
                    placed.contains(dep)
                        || store
                            .get(dep)
                            .is_some_and(|d| d.status() == TransactionStatus::Completed)
                });
                if ready {
                    batch.push(&tx.id);
                }
            }

            if batch.is_empty() {
                break;
            }
            placed.extend(batch.iter().copied());
            batches.push(batch.into_iter().cloned().collect::<Vec<_>>());
        }

        let blocked: Vec<TransactionId> = candidates
            .iter()
            .filter(|tx| !placed.contains(&tx.id))
            .map(|tx| tx.id.clone())
            .collect();

        debug!(
            "Planned {} batches ({} transactions), {} blocked",
            batches.len(),
            placed.len(),
            blocked.len()
        );
        SyncPlan { batches, blocked }
    }

    /// Pending and retrying transactions whose dependencies can never complete.
    pub fn find_stalled(store: &QueueStore) -> Vec<(TransactionId, StallReason)> {
        let mut walker = StallWalker {
            store,
            memo: HashMap::new(),
            visiting: HashSet::new(),
        };

        let mut stalled: Vec<(TransactionId, StallReason)> = store
            .iter()
            .filter(|tx| is_waiting(tx.status()))
            .filter_map(|tx| walker.check(&tx.id).map(|reason| (tx.id.clone(), reason)))
            .collect();
        stalled.sort_by(|a, b| a.0.cmp(&b.0));
        stalled
    }
}

fn is_waiting(status: TransactionStatus) -> bool {
    matches!(status, TransactionStatus::Pending | TransactionStatus::Retry)
}

struct StallWalker<'a> {
    store: &'a QueueStore,
    memo: HashMap<TransactionId, Option<StallReason>>,
    visiting: HashSet<TransactionId>,
}

impl StallWalker<'_> {
    fn check(&mut self, id: &TransactionId) -> Option<StallReason> {
        if let Some(known) = self.memo.get(id) {
            return known.clone();
        }
        let store = self.store;
        let Some(tx) = store.get(id) else {
            return None;
        };

        self.visiting.insert(id.clone());
        let mut reason = None;
        for dep in &tx.depends_on {
            reason = match store.get(dep).map(|d| d.status()) {
                None => Some(StallReason::MissingDependency(dep.clone())),
                Some(TransactionStatus::Failed) => Some(StallReason::FailedDependency(dep.clone())),
                Some(status) if is_waiting(status) => {
                    if self.visiting.contains(dep) {
                        Some(StallReason::DependencyCycle)
                    } else {
                        self.check(dep)
                    }
                }
                Some(_) => None,
            };
            if reason.is_some() {
                break;
            }
        }
        self.visiting.remove(id);

        self.memo.insert(id.clone(), reason.clone());
        reason
    }
}
