//! Typed lifecycle events.
//!
//! Observers either register a handler for one `EventKind` with `on`, or
//! take a broadcast receiver of every event with `subscribe`. Handlers run
//! synchronously on the emitting task and must not block.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use txqueue_common::TransactionId;

use crate::conflict::ConflictRecord;
use crate::scheduler::StallReason;
use crate::transaction::{Priority, TransactionKind};

/// What started a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Manual,
    Enqueue,
    RetryDue,
    Reconnect,
    Periodic,
}

/// Lifecycle event emitted by the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    TransactionQueued {
        id: TransactionId,
        kind: TransactionKind,
        priority: Priority,
    },
    TransactionProcessing {
        id: TransactionId,
    },
    TransactionCompleted {
        id: TransactionId,
    },
    TransactionFailed {
        id: TransactionId,
        error: String,
    },
    TransactionRetryScheduled {
        id: TransactionId,
        retry_count: u32,
        delay_ms: u64,
    },
    /// Backoff elapsed, back to pending.
    TransactionRequeued {
        id: TransactionId,
    },
    TransactionConflict {
        record: ConflictRecord,
    },
    TransactionRemoved {
        id: TransactionId,
    },
    TransactionsCleaned {
        count: usize,
    },
    /// A dependency can never complete.
    TransactionStalled {
        id: TransactionId,
        reason: StallReason,
    },
    SyncStarted {
        trigger: SyncTrigger,
    },
    SyncCompleted {
        successful: usize,
        failed: usize,
        conflicts: usize,
        duration_ms: u64,
    },
    SyncFailed {
        error: String,
    },
    NetworkOnline,
    NetworkOffline,
}

/// Discriminant of `QueueEvent`, used to pick events in `on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TransactionQueued,
    TransactionProcessing,
    TransactionCompleted,
    TransactionFailed,
    TransactionRetryScheduled,
    TransactionRequeued,
    TransactionConflict,
    TransactionRemoved,
    TransactionsCleaned,
    TransactionStalled,
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    NetworkOnline,
    NetworkOffline,
}

impl QueueEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            QueueEvent::TransactionQueued { .. } => EventKind::TransactionQueued,
            QueueEvent::TransactionProcessing { .. } => EventKind::TransactionProcessing,
            QueueEvent::TransactionCompleted { .. } => EventKind::TransactionCompleted,
            QueueEvent::TransactionFailed { .. } => EventKind::TransactionFailed,
            QueueEvent::TransactionRetryScheduled { .. } => EventKind::TransactionRetryScheduled,
            QueueEvent::TransactionRequeued { .. } => EventKind::TransactionRequeued,
            QueueEvent::TransactionConflict { .. } => EventKind::TransactionConflict,
            QueueEvent::TransactionRemoved { .. } => EventKind::TransactionRemoved,
            QueueEvent::TransactionsCleaned { .. } => EventKind::TransactionsCleaned,
            QueueEvent::TransactionStalled { .. } => EventKind::TransactionStalled,
            QueueEvent::SyncStarted { .. } => EventKind::SyncStarted,
            QueueEvent::SyncCompleted { .. } => EventKind::SyncCompleted,
            QueueEvent::SyncFailed { .. } => EventKind::SyncFailed,
            QueueEvent::NetworkOnline => EventKind::NetworkOnline,
            QueueEvent::NetworkOffline => EventKind::NetworkOffline,
        }
    }

    /// Transaction the event is about, if any.
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        match self {
            QueueEvent::TransactionQueued { id, .. }
            | QueueEvent::TransactionProcessing { id }
            | QueueEvent::TransactionCompleted { id }
            | QueueEvent::TransactionFailed { id, .. }
            | QueueEvent::TransactionRetryScheduled { id, .. }
            | QueueEvent::TransactionRequeued { id }
            | QueueEvent::TransactionRemoved { id }
            | QueueEvent::TransactionStalled { id, .. } => Some(id),
            QueueEvent::TransactionConflict { record } => Some(&record.transaction_id),
            _ => None,
        }
    }
}

/// Identifies a registered handler for `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

struct Listener {
    id: ListenerId,
    kind: EventKind,
    handler: Handler,
}

/// Fan-out of queue events to handlers and broadcast subscribers.
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
    listeners: RwLock<Vec<Listener>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a bus whose broadcast subscribers may lag by `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(Listener {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Unregister a handler. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event to matching handlers, then to subscribers.
    pub fn emit(&self, event: QueueEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners
                .iter()
                .filter(|l| l.kind == kind)
                .map(|l| l.handler.clone())
                .collect()
        };

        for handler in handlers {
            handler(&event);
        }

        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
