//! txqueue sync queue
//!
//! Durable queue of state-changing transactions (payments, refunds, voids,
//! captures) captured while offline and synced to a remote endpoint later:
//! - Bounded store with terminal-first eviction, persisted after every change
//! - Dependency-aware, priority-ordered batch planning
//! - Concurrent batch submission with duplicate and invalid handling
//! - Retry with a fixed backoff table driven by a timer service
//! - Reconnect-triggered sync, typed lifecycle events and metrics

pub mod config;
pub mod conflict;
pub mod engine;
pub mod events;
pub mod metrics;
pub mod network;
pub mod persist;
pub mod processor;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod timer;
pub mod transaction;
pub mod validation;

// Re-export main types
pub use config::QueueConfig;
pub use conflict::{ConflictRecord, ConflictResolver, ConflictType, InvalidPolicy, ResolutionStrategy};
pub use engine::{QueueBuilder, SyncResult, TransactionQueue};
pub use events::{EventBus, EventKind, ListenerId, QueueEvent, SyncTrigger};
pub use metrics::QueueMetrics;
pub use network::NetworkMonitor;
pub use processor::{RemoteEndpoint, SubmitResponse, SubmitStatus};
pub use retry::{RetryConfig, RetryManager};
pub use scheduler::{DependencyScheduler, StallReason, SyncPlan};
pub use store::{QueueSnapshot, QueueStore};
pub use timer::{TimerHandle, TimerService};
pub use transaction::{
    NewTransaction, Priority, Transaction, TransactionFilter, TransactionKind, TransactionStatus,
};
pub use validation::{AcceptAll, PayloadValidator, PaymentPayloadValidator};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = QueueConfig::default();
        let _retry_config = RetryConfig::default();
        let _resolver = ConflictResolver::default();
        let _store = QueueStore::new(1);
    }
}
