//! In-memory transaction table and its persisted snapshot form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use txqueue_common::{Error, Result, TransactionId};

use crate::transaction::{Transaction, TransactionFilter, TransactionStatus};

/// Serialized form of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub transactions: Vec<(TransactionId, Transaction)>,
    pub last_updated: DateTime<Utc>,
}

impl QueueSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Bounded map of queued transactions.
#[derive(Debug, Clone)]
pub struct QueueStore {
    transactions: HashMap<TransactionId, Transaction>,
    max_size: usize,
}

impl QueueStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            transactions: HashMap::new(),
            max_size,
        }
    }

    /// Rebuild from a snapshot. A snapshot larger than `max_size` is kept
    /// whole; eviction catches up on the next insert.
    pub fn from_snapshot(snapshot: QueueSnapshot, max_size: usize) -> Self {
        let transactions: HashMap<_, _> = snapshot.transactions.into_iter().collect();
        if transactions.len() > max_size {
            warn!(
                "Loaded {} transactions, above the configured limit of {}",
                transactions.len(),
                max_size
            );
        }
        Self {
            transactions,
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn get(&self, id: &TransactionId) -> Option<&Transaction> {
        self.transactions.get(id)
    }

    pub fn get_mut(&mut self, id: &TransactionId) -> Option<&mut Transaction> {
        self.transactions.get_mut(id)
    }

    pub fn contains(&self, id: &TransactionId) -> bool {
        self.transactions.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Transaction> {
        self.transactions.values_mut()
    }

    /// Insert a transaction, evicting terminal entries first if the store is
    /// full. Returns the evicted transactions.
    ///
    /// # Errors
    /// - `Error::QueueFull` if the store is full of live transactions
    pub fn insert(&mut self, tx: Transaction) -> Result<Vec<Transaction>> {
        let evicted = if self.transactions.contains_key(&tx.id) {
            Vec::new()
        } else {
            self.make_room()?
        };

        self.transactions.insert(tx.id.clone(), tx);
        Ok(evicted)
    }

    /// Put back a transaction taken out by `insert`, `remove` or `cleanup`.
    /// Ignores the size bound.
    pub fn restore(&mut self, tx: Transaction) {
        self.transactions.insert(tx.id.clone(), tx);
    }

    /// IDs that some pending or retrying transaction still depends on.
    fn live_dependencies(&self) -> HashSet<&TransactionId> {
        self.transactions
            .values()
            .filter(|tx| !tx.status().is_terminal())
            .flat_map(|tx| tx.depends_on.iter())
            .collect()
    }

    fn make_room(&mut self) -> Result<Vec<Transaction>> {
        if self.transactions.len() < self.max_size {
            return Ok(Vec::new());
        }
        let excess = self.transactions.len() + 1 - self.max_size;

        let chosen: Vec<TransactionId> = {
            let needed = self.live_dependencies();
            let mut victims: Vec<&Transaction> = self
                .transactions
                .values()
                .filter(|tx| tx.status().is_terminal() && !needed.contains(&tx.id))
                .collect();
            if victims.len() < excess {
                return Err(Error::QueueFull(self.transactions.len()));
            }

            // Completed before failed, oldest first within each.
            victims.sort_by(|a, b| {
                let rank = |tx: &Transaction| (tx.status() != TransactionStatus::Completed) as u8;
                rank(a)
                    .cmp(&rank(b))
                    .then(a.timestamp.cmp(&b.timestamp))
                    .then(a.id.cmp(&b.id))
            });
            victims.into_iter().take(excess).map(|tx| tx.id.clone()).collect()
        };

        let evicted = self.take_all(&chosen);
        for tx in &evicted {
            debug!("Evicted transaction {}", tx.id);
        }
        Ok(evicted)
    }

    fn take_all(&mut self, ids: &[TransactionId]) -> Vec<Transaction> {
        ids.iter()
            .filter_map(|id| self.transactions.remove(id))
            .collect()
    }

    pub fn remove(&mut self, id: &TransactionId) -> Option<Transaction> {
        self.transactions.remove(id)
    }

    /// Transactions matching `filter`, newest first.
    pub fn list(&self, filter: &TransactionFilter) -> Vec<Transaction> {
        let mut matching: Vec<Transaction> = self
            .transactions
            .values()
            .filter(|tx| filter.matches(tx))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));
        matching
    }

    /// Drop completed transactions created before `cutoff`. Entries a live
    /// transaction still depends on are kept.
    pub fn cleanup(&mut self, cutoff: DateTime<Utc>) -> Vec<Transaction> {
        let expired: Vec<TransactionId> = {
            let needed = self.live_dependencies();
            self.transactions
                .values()
                .filter(|tx| {
                    tx.status() == TransactionStatus::Completed
                        && tx.timestamp < cutoff
                        && !needed.contains(&tx.id)
                })
                .map(|tx| tx.id.clone())
                .collect()
        };
        self.take_all(&expired)
    }

    pub fn count_by_status(&self, status: TransactionStatus) -> usize {
        self.transactions
            .values()
            .filter(|tx| tx.status() == status)
            .count()
    }

    /// Snapshot of every transaction, ordered by ID.
    pub fn snapshot(&self) -> QueueSnapshot {
        let mut transactions: Vec<(TransactionId, Transaction)> = self
            .transactions
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();
        transactions.sort_by(|a, b| a.0.cmp(&b.0));

        QueueSnapshot {
            transactions,
            last_updated: Utc::now(),
        }
    }
}
