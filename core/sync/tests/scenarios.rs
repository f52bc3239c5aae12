//! End-to-end queue behavior against scripted endpoints.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use txqueue_common::{Error, TransactionId};
use txqueue_storage::{MemoryStore, SnapshotStore};
use txqueue_sync::{
    ConflictType, EventKind, NetworkMonitor, NewTransaction, QueueBuilder, QueueConfig,
    QueueEvent, QueueStore, ResolutionStrategy, StallReason, Transaction, TransactionKind,
    TransactionStatus,
};

use common::*;

#[tokio::test]
async fn dependencies_complete_in_order() {
    let endpoint = ScriptedEndpoint::new();
    let queue = open_in_memory(endpoint.clone()).await;

    let completed = Arc::new(Mutex::new(Vec::new()));
    let sink = completed.clone();
    queue.on(EventKind::TransactionCompleted, move |event| {
        if let Some(id) = event.transaction_id() {
            sink.lock().unwrap().push(id.clone());
        }
    });

    let a = queue.enqueue(payment(100)).await.unwrap();
    let b = queue
        .enqueue(payment(200).depends_on(a.clone()))
        .await
        .unwrap();
    let c = queue
        .enqueue(payment(300).depends_on(b.clone()))
        .await
        .unwrap();

    for _ in 0..5 {
        queue.process_queue().await.unwrap();
        if queue.metrics().await.completed == 3 {
            break;
        }
    }

    assert_eq!(*completed.lock().unwrap(), vec![a.clone(), b.clone(), c.clone()]);
    assert_eq!(endpoint.submitted(), vec![a, b, c]);
}

#[tokio::test]
async fn higher_priority_is_submitted_first() {
    let endpoint = ScriptedEndpoint::new();
    let config = QueueConfig {
        batch_size: 1,
        ..manual_config()
    };
    let queue = open(Arc::new(MemoryStore::new()), endpoint.clone(), config).await;

    let low = queue
        .enqueue(payment(1).with_priority(txqueue_sync::Priority::Low))
        .await
        .unwrap();
    let critical = queue
        .enqueue(payment(2).with_priority(txqueue_sync::Priority::Critical))
        .await
        .unwrap();
    let normal = queue.enqueue(payment(3)).await.unwrap();

    let result = queue.process_queue().await.unwrap();
    assert_eq!(result.batches, 3);
    assert_eq!(endpoint.submitted(), vec![critical, normal, low]);
}

#[tokio::test]
async fn retries_until_budget_is_exhausted() {
    let endpoint = ScriptedEndpoint::new();
    // Periodic syncs pick up the retry even if its timer fires mid-cycle.
    let config = QueueConfig {
        sync_interval_ms: Some(40),
        ..auto_config()
    };
    let queue = open(Arc::new(MemoryStore::new()), endpoint, config).await;
    let mut events = queue.subscribe();

    let id = queue
        .enqueue(payment(100).with_max_retries(2).with_tag(UNREACHABLE))
        .await
        .unwrap();

    let seen = collect_until(&mut events, Duration::from_secs(5), |event| {
        matches!(event, QueueEvent::TransactionFailed { .. })
    })
    .await;

    let statuses: Vec<&str> = seen
        .iter()
        .filter(|event| event.transaction_id() == Some(&id))
        .filter_map(|event| match event {
            QueueEvent::TransactionQueued { .. } | QueueEvent::TransactionRequeued { .. } => {
                Some("pending")
            }
            QueueEvent::TransactionProcessing { .. } => Some("processing"),
            QueueEvent::TransactionRetryScheduled { .. } => Some("retry"),
            QueueEvent::TransactionFailed { .. } => Some("failed"),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec!["pending", "processing", "retry", "pending", "processing", "failed"]
    );
    assert!(seen.iter().any(|event| matches!(
        event,
        QueueEvent::SyncFailed { error } if error == "endpoint unreachable"
    )));

    let tx = queue.get(&id).await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Failed);
    assert_eq!(tx.retry_count(), 2);
    assert_eq!(tx.last_error.as_deref(), Some("Network error: connection refused"));
}

#[tokio::test]
async fn duplicate_is_a_conflict_not_a_failure() {
    let queue = open_in_memory(ScriptedEndpoint::new()).await;
    let id = queue.enqueue(payment(100).with_tag(DUPLICATE)).await.unwrap();

    let result = queue.process_queue().await.unwrap();

    assert!(!result.successful.contains(&id));
    assert!(!result.failed.contains(&id));
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].transaction_id, id);
    assert_eq!(result.conflicts[0].conflict_type, ConflictType::Duplicate);
    assert_eq!(result.conflicts[0].resolution, ResolutionStrategy::Merge);

    let tx = queue.get(&id).await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Completed);
    assert_eq!(tx.retry_count(), 0);
    assert_eq!(queue.metrics().await.conflicts, 1);
}

#[tokio::test]
async fn duplicate_unblocks_dependents() {
    let queue = open_in_memory(ScriptedEndpoint::new()).await;
    let auth = queue.enqueue(payment(100).with_tag(DUPLICATE)).await.unwrap();
    let capture = queue
        .enqueue(
            NewTransaction::new(TransactionKind::Capture, json!({"amount": 100}))
                .depends_on(auth),
        )
        .await
        .unwrap();

    let result = queue.process_queue().await.unwrap();
    assert_eq!(result.successful, vec![capture.clone()]);
    assert_eq!(
        queue.get(&capture).await.unwrap().status(),
        TransactionStatus::Completed
    );
}

#[tokio::test]
async fn reconnect_triggers_sync() {
    let monitor = NetworkMonitor::new(false);
    let queue = QueueBuilder::new(Arc::new(MemoryStore::new()), ScriptedEndpoint::new())
        .with_config(auto_config())
        .with_network(&monitor)
        .build()
        .await
        .unwrap();

    let first = queue.enqueue(payment(100)).await.unwrap();
    let second = queue.enqueue(payment(200)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.metrics().await.pending, 2);

    let mut events = queue.subscribe();
    let online_at = Instant::now();
    monitor.set_online(true);

    let seen = collect_until(&mut events, Duration::from_secs(5), |event| {
        matches!(event, QueueEvent::SyncCompleted { .. })
    })
    .await;

    assert!(online_at.elapsed() >= Duration::from_millis(20));
    assert!(matches!(seen[0], QueueEvent::NetworkOnline));
    assert!(seen.iter().any(|event| matches!(
        event,
        QueueEvent::SyncStarted {
            trigger: txqueue_sync::SyncTrigger::Reconnect
        }
    )));
    for id in [first, second] {
        assert_eq!(
            queue.get(&id).await.unwrap().status(),
            TransactionStatus::Completed
        );
    }
}

#[tokio::test]
async fn going_offline_only_emits_an_event() {
    let monitor = NetworkMonitor::new(true);
    let queue = QueueBuilder::new(Arc::new(MemoryStore::new()), ScriptedEndpoint::new())
        .with_config(manual_config())
        .with_network(&monitor)
        .build()
        .await
        .unwrap();
    let id = queue.enqueue(payment(100)).await.unwrap();
    let mut events = queue.subscribe();

    monitor.set_online(false);
    collect_until(&mut events, Duration::from_secs(2), |event| {
        matches!(event, QueueEvent::NetworkOffline)
    })
    .await;

    assert_eq!(queue.process_queue().await.unwrap().batches, 0);
    assert_eq!(
        queue.get(&id).await.unwrap().status(),
        TransactionStatus::Pending
    );
}

fn aged(status: TransactionStatus, age_days: i64) -> Transaction {
    let mut tx = Transaction::new(
        TransactionId::generate(),
        NewTransaction::new(TransactionKind::Refund, json!({"amount": 5})),
        3,
    );
    tx.timestamp = Utc::now() - ChronoDuration::days(age_days);
    match status {
        TransactionStatus::Completed => {
            tx.mark_processing().unwrap();
            tx.mark_completed().unwrap();
        }
        TransactionStatus::Pending => {}
        other => panic!("unsupported fixture status {}", other),
    }
    tx
}

async fn seeded_store(transactions: Vec<Transaction>) -> Arc<MemoryStore> {
    let mut seed = QueueStore::new(100);
    for tx in transactions {
        seed.insert(tx).unwrap();
    }
    let backend = Arc::new(MemoryStore::new());
    backend
        .save(&seed.snapshot().to_bytes().unwrap())
        .await
        .unwrap();
    backend
}

#[tokio::test]
async fn cleanup_removes_only_old_completed() {
    let old: Vec<Transaction> = (0..3)
        .map(|_| aged(TransactionStatus::Completed, 10))
        .collect();
    let recent = aged(TransactionStatus::Completed, 1);
    let old_pending = aged(TransactionStatus::Pending, 30);
    let keep = [recent.id.clone(), old_pending.id.clone()];
    let gone: Vec<TransactionId> = old.iter().map(|tx| tx.id.clone()).collect();

    let mut fixtures = old;
    fixtures.push(recent);
    fixtures.push(old_pending);
    let backend = seeded_store(fixtures).await;

    let queue = open(backend, ScriptedEndpoint::new(), manual_config()).await;
    let mut events = queue.subscribe();
    assert_eq!(queue.metrics().await.total, 5);

    assert_eq!(queue.cleanup(7).await.unwrap(), 3);

    let metrics = queue.metrics().await;
    assert_eq!(metrics.total, 2);
    assert_eq!(metrics.completed, 1);
    for id in &gone {
        assert!(queue.get(id).await.is_none());
    }
    for id in &keep {
        assert!(queue.get(id).await.is_some());
    }
    assert_eq!(
        events.recv().await.unwrap(),
        QueueEvent::TransactionsCleaned { count: 3 }
    );
}

#[tokio::test]
async fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.snapshot");

    let (pending, done) = {
        let store = Arc::new(txqueue_storage::FileStore::new(&path).unwrap());
        let queue = open(store, ScriptedEndpoint::new(), manual_config()).await;
        let done = queue.enqueue(payment(1)).await.unwrap();
        queue.process_queue().await.unwrap();
        let pending = queue
            .enqueue(payment(2).with_tag("lane-3").with_priority(txqueue_sync::Priority::High))
            .await
            .unwrap();
        queue.shutdown();
        (pending, done)
    };

    let store = Arc::new(txqueue_storage::FileStore::new(&path).unwrap());
    let queue = open(store, ScriptedEndpoint::new(), manual_config()).await;

    let restored = queue.get(&pending).await.unwrap();
    assert_eq!(restored.status(), TransactionStatus::Pending);
    assert!(restored.tags.contains("lane-3"));
    assert_eq!(restored.priority, txqueue_sync::Priority::High);
    assert_eq!(
        queue.get(&done).await.unwrap().status(),
        TransactionStatus::Completed
    );
}

#[tokio::test]
async fn interrupted_submission_is_resubmitted() {
    let mut interrupted = aged(TransactionStatus::Pending, 0);
    interrupted.mark_processing().unwrap();
    let id = interrupted.id.clone();
    let backend = seeded_store(vec![interrupted]).await;

    let endpoint = ScriptedEndpoint::new();
    let queue = open(backend.clone(), endpoint.clone(), manual_config()).await;

    let recovered = queue.get(&id).await.unwrap();
    assert!(matches!(
        recovered.status(),
        TransactionStatus::Retry | TransactionStatus::Pending
    ));
    assert_eq!(recovered.retry_count(), 0);
    // The recovery itself was persisted.
    assert!(backend.save_count() >= 2);

    queue.process_queue().await.unwrap();
    assert_eq!(
        queue.get(&id).await.unwrap().status(),
        TransactionStatus::Completed
    );
    assert_eq!(endpoint.submitted(), vec![id]);
}

#[tokio::test]
async fn invalid_fails_fast_and_stalls_dependents() {
    let queue = open_in_memory(ScriptedEndpoint::new()).await;
    let mut events = queue.subscribe();

    let auth = queue.enqueue(payment(100).with_tag(INVALID)).await.unwrap();
    let capture = queue
        .enqueue(
            NewTransaction::new(TransactionKind::Capture, json!({"amount": 100}))
                .depends_on(auth.clone()),
        )
        .await
        .unwrap();

    let result = queue.process_queue().await.unwrap();
    assert_eq!(result.failed, vec![auth.clone()]);
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].conflict_type, ConflictType::Invalid);
    assert_eq!(result.conflicts[0].resolution, ResolutionStrategy::Reject);

    let failed = queue.get(&auth).await.unwrap();
    assert_eq!(failed.status(), TransactionStatus::Failed);
    assert_eq!(failed.retry_count(), 0);
    assert_eq!(
        queue.get(&capture).await.unwrap().status(),
        TransactionStatus::Pending
    );

    let seen = collect_until(&mut events, Duration::from_secs(2), |event| {
        matches!(event, QueueEvent::SyncCompleted { .. })
    })
    .await;
    let stalls: Vec<&QueueEvent> = seen
        .iter()
        .filter(|event| event.kind() == EventKind::TransactionStalled)
        .collect();
    assert_eq!(
        stalls,
        vec![&QueueEvent::TransactionStalled {
            id: capture.clone(),
            reason: StallReason::FailedDependency(auth),
        }]
    );
    assert_eq!(queue.metrics().await.stalled, 1);

    // Reported once, not on every cycle.
    queue.process_queue().await.unwrap();
    let seen = collect_until(&mut events, Duration::from_secs(2), |event| {
        matches!(event, QueueEvent::SyncCompleted { .. })
    })
    .await;
    assert!(seen
        .iter()
        .all(|event| event.kind() != EventKind::TransactionStalled));
}

#[tokio::test]
async fn missing_dependency_stalls() {
    let queue = open_in_memory(ScriptedEndpoint::new()).await;
    let ghost = TransactionId::generate();
    let orphan = queue
        .enqueue(payment(10).depends_on(ghost.clone()))
        .await
        .unwrap();

    let mut events = queue.subscribe();
    queue.process_queue().await.unwrap();

    let seen = collect_until(&mut events, Duration::from_secs(2), |event| {
        matches!(event, QueueEvent::SyncCompleted { .. })
    })
    .await;
    assert!(seen.contains(&QueueEvent::TransactionStalled {
        id: orphan,
        reason: StallReason::MissingDependency(ghost),
    }));
}

#[tokio::test]
async fn removed_transaction_never_fires_its_retry() {
    let queue = open_in_memory(ScriptedEndpoint::new()).await;
    let id = queue
        .enqueue(payment(100).with_tag(UNREACHABLE))
        .await
        .unwrap();

    let result = queue.process_queue().await.unwrap();
    assert_eq!(result.retried, 1);
    assert_eq!(
        queue.get(&id).await.unwrap().status(),
        TransactionStatus::Retry
    );

    let mut events = queue.subscribe();
    assert!(queue.remove(&id).await.unwrap());
    assert!(!queue.remove(&id).await.unwrap());

    // Well past the 30ms backoff.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut after_removal = Vec::new();
    while let Ok(event) = events.try_recv() {
        after_removal.push(event);
    }
    assert_eq!(after_removal, vec![QueueEvent::TransactionRemoved { id: id.clone() }]);
    assert!(queue.get(&id).await.is_none());
}

#[tokio::test]
async fn capacity_evicts_terminal_then_refuses() {
    let config = QueueConfig {
        max_queue_size: 2,
        ..manual_config()
    };
    let queue = open(Arc::new(MemoryStore::new()), ScriptedEndpoint::new(), config).await;

    let first = queue.enqueue(payment(1)).await.unwrap();
    let second = queue.enqueue(payment(2)).await.unwrap();
    queue.process_queue().await.unwrap();

    queue.enqueue(payment(3)).await.unwrap();
    queue.enqueue(payment(4)).await.unwrap();
    assert_eq!(queue.metrics().await.total, 2);
    assert!(queue.get(&first).await.is_none());
    assert!(queue.get(&second).await.is_none());

    let err = queue.enqueue(payment(5)).await.unwrap_err();
    assert!(matches!(err, Error::QueueFull(2)));
    assert_eq!(queue.metrics().await.total, 2);
}

#[tokio::test]
async fn concurrent_process_queue_is_a_noop() {
    let endpoint = ScriptedEndpoint::slow(Duration::from_millis(100));
    let queue = open_in_memory(endpoint.clone()).await;
    let id = queue.enqueue(payment(100)).await.unwrap();
    let mut events = queue.subscribe();

    let (left, right) = tokio::join!(queue.process_queue(), queue.process_queue());
    let (left, right) = (left.unwrap(), right.unwrap());

    let mut successful = left.successful.clone();
    successful.extend(right.successful.clone());
    assert_eq!(successful, vec![id]);
    assert!(left.batches == 0 || right.batches == 0);
    assert_eq!(endpoint.submitted().len(), 1);

    // The losing call is dropped, not replayed once the cycle ends.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut started = 0;
    while let Ok(event) = events.try_recv() {
        if event.kind() == EventKind::SyncStarted {
            started += 1;
        }
    }
    assert_eq!(started, 1);
}

#[tokio::test]
async fn enqueue_triggers_sync_when_auto() {
    let queue = open(
        Arc::new(MemoryStore::new()),
        ScriptedEndpoint::new(),
        auto_config(),
    )
    .await;
    let mut events = queue.subscribe();

    let id = queue.enqueue(payment(100)).await.unwrap();
    collect_until(&mut events, Duration::from_secs(2), |event| {
        matches!(event, QueueEvent::TransactionCompleted { .. })
    })
    .await;

    assert_eq!(
        queue.get(&id).await.unwrap().status(),
        TransactionStatus::Completed
    );
}

#[tokio::test]
async fn retry_policy_spends_budget_on_invalid() {
    let config = QueueConfig {
        invalid_policy: txqueue_sync::InvalidPolicy::Retry,
        ..manual_config()
    };
    let queue = open(Arc::new(MemoryStore::new()), ScriptedEndpoint::new(), config).await;
    let id = queue.enqueue(payment(100).with_tag(INVALID)).await.unwrap();

    let result = queue.process_queue().await.unwrap();
    assert_eq!(result.retried, 1);
    assert!(result.conflicts.is_empty());

    let tx = queue.get(&id).await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Retry);
    assert_eq!(tx.retry_count(), 1);
    assert_eq!(tx.last_error.as_deref(), Some("card declined by validation"));
}

#[tokio::test]
async fn failed_claim_leaves_batch_queued() {
    let store = FailingStore::new();
    let endpoint = ScriptedEndpoint::new();
    let queue = open(store.clone(), endpoint.clone(), manual_config()).await;
    let id = queue.enqueue(payment(100)).await.unwrap();
    let mut events = queue.subscribe();

    store.set_failing(true);
    let err = queue.process_queue().await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    assert_eq!(
        queue.get(&id).await.unwrap().status(),
        TransactionStatus::Pending
    );
    assert!(endpoint.submitted().is_empty());
    collect_until(&mut events, Duration::from_secs(2), |event| {
        matches!(event, QueueEvent::SyncFailed { .. })
    })
    .await;

    store.set_failing(false);
    let result = queue.process_queue().await.unwrap();
    assert_eq!(result.successful, vec![id.clone()]);
    assert_eq!(endpoint.submitted(), vec![id.clone()]);

    let persisted = store.persisted().await.unwrap();
    assert_eq!(persisted.transactions.len(), 1);
    assert_eq!(persisted.transactions[0].1.status(), TransactionStatus::Completed);
}

#[tokio::test]
async fn failed_writes_leave_memory_matching_the_store() {
    let store = FailingStore::new();
    let config = QueueConfig {
        max_queue_size: 1,
        ..manual_config()
    };
    let queue = open(store.clone(), ScriptedEndpoint::new(), config).await;
    let done = queue.enqueue(payment(1)).await.unwrap();
    queue.process_queue().await.unwrap();
    let mut events = queue.subscribe();

    store.set_failing(true);
    let err = queue.enqueue(payment(2)).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    // The completed entry evicted for the new one is back.
    let metrics = queue.metrics().await;
    assert_eq!(metrics.total, 1);
    assert_eq!(metrics.completed, 1);
    assert!(queue.get(&done).await.is_some());

    assert!(queue.remove(&done).await.is_err());
    assert!(queue.get(&done).await.is_some());
    assert!(events.try_recv().is_err());

    store.set_failing(false);
    let fresh = queue.enqueue(payment(3)).await.unwrap();
    let persisted = store.persisted().await.unwrap();
    let ids: Vec<&TransactionId> = persisted.transactions.iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![&fresh]);
}

#[tokio::test]
async fn eviction_keeps_completed_dependency() {
    let config = QueueConfig {
        max_queue_size: 2,
        ..manual_config()
    };
    let queue = open(Arc::new(MemoryStore::new()), ScriptedEndpoint::new(), config).await;

    let auth = queue.enqueue(payment(100)).await.unwrap();
    queue.process_queue().await.unwrap();
    let capture = queue
        .enqueue(
            NewTransaction::new(TransactionKind::Capture, json!({"amount": 100}))
                .depends_on(auth.clone()),
        )
        .await
        .unwrap();

    // The only terminal entry is still needed by the capture.
    let err = queue.enqueue(payment(5)).await.unwrap_err();
    assert!(matches!(err, Error::QueueFull(2)));
    assert!(queue.get(&auth).await.is_some());

    let result = queue.process_queue().await.unwrap();
    assert_eq!(result.successful, vec![capture]);
    assert_eq!(queue.metrics().await.stalled, 0);

    queue.enqueue(payment(5)).await.unwrap();
    assert!(queue.get(&auth).await.is_none());
}

#[tokio::test]
async fn unsendable_transaction_fails_without_retry() {
    let queue = open_in_memory(ScriptedEndpoint::new()).await;
    let mut events = queue.subscribe();
    let id = queue.enqueue(payment(100).with_tag(UNSENDABLE)).await.unwrap();

    let result = queue.process_queue().await.unwrap();
    assert_eq!(result.failed, vec![id.clone()]);
    assert_eq!(result.retried, 0);

    let tx = queue.get(&id).await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Failed);
    assert_eq!(tx.retry_count(), 0);

    let seen = collect_until(&mut events, Duration::from_secs(2), |event| {
        matches!(
            event,
            QueueEvent::SyncCompleted { .. } | QueueEvent::SyncFailed { .. }
        )
    })
    .await;
    assert!(matches!(seen.last(), Some(QueueEvent::SyncCompleted { .. })));
}

#[tokio::test]
async fn read_only_queue_never_writes() {
    let mut interrupted = aged(TransactionStatus::Pending, 0);
    interrupted.mark_processing().unwrap();
    let id = interrupted.id.clone();
    let backend = seeded_store(vec![interrupted]).await;
    let saves = backend.save_count();

    let queue = QueueBuilder::new(backend.clone(), ScriptedEndpoint::new())
        .with_config(manual_config())
        .read_only()
        .build()
        .await
        .unwrap();

    assert_eq!(
        queue.get(&id).await.unwrap().status(),
        TransactionStatus::Processing
    );
    assert!(matches!(
        queue.enqueue(payment(1)).await,
        Err(Error::ReadOnly)
    ));
    assert!(matches!(queue.remove(&id).await, Err(Error::ReadOnly)));
    assert!(queue.process_queue().await.is_ok());
    assert_eq!(queue.metrics().await.total, 1);
    assert_eq!(backend.save_count(), saves);
}
