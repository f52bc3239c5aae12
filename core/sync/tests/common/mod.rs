//! Shared fixtures for the queue integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use txqueue_common::{Error, Result, TransactionId};
use txqueue_storage::{MemoryStore, SnapshotStore};
use txqueue_sync::{
    NewTransaction, QueueBuilder, QueueConfig, QueueEvent, QueueSnapshot, RemoteEndpoint,
    RetryConfig,
    SubmitResponse, Transaction, TransactionKind, TransactionQueue,
};

/// Tag that makes the scripted endpoint answer `duplicate`.
pub const DUPLICATE: &str = "reply:duplicate";
/// Tag that makes the scripted endpoint answer `invalid`.
pub const INVALID: &str = "reply:invalid";
/// Tag that makes the scripted endpoint fail at the transport level.
pub const UNREACHABLE: &str = "reply:unreachable";
/// Tag that makes the scripted endpoint refuse to send the transaction.
pub const UNSENDABLE: &str = "reply:unsendable";

/// Endpoint whose answer is picked by the transaction's tags. Untagged
/// transactions succeed. Every submission is recorded in order.
#[derive(Default)]
pub struct ScriptedEndpoint {
    delay: Duration,
    submitted: Mutex<Vec<TransactionId>>,
}

impl ScriptedEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer only after `delay`.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn submitted(&self) -> Vec<TransactionId> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteEndpoint for ScriptedEndpoint {
    async fn submit(&self, transaction: &Transaction) -> Result<SubmitResponse> {
        self.submitted.lock().unwrap().push(transaction.id.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if transaction.tags.contains(UNREACHABLE) {
            Err(Error::Network("connection refused".into()))
        } else if transaction.tags.contains(UNSENDABLE) {
            Err(Error::InvalidInput("payload cannot be encoded".into()))
        } else if transaction.tags.contains(DUPLICATE) {
            Ok(SubmitResponse::duplicate("already recorded"))
        } else if transaction.tags.contains(INVALID) {
            Ok(SubmitResponse::invalid("card declined by validation"))
        } else {
            Ok(SubmitResponse::success())
        }
    }
}

/// Memory store whose saves can be made to fail.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// The last snapshot that made it to the store.
    pub async fn persisted(&self) -> Option<QueueSnapshot> {
        let bytes = self.inner.load().await.unwrap()?;
        Some(QueueSnapshot::from_bytes(&bytes).unwrap())
    }
}

#[async_trait]
impl SnapshotStore for FailingStore {
    async fn save(&self, snapshot: &[u8]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage("disk full".into()));
        }
        self.inner.save(snapshot).await
    }

    async fn load(&self) -> Result<Option<Vec<u8>>> {
        self.inner.load().await
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Config for tests that drive cycles by hand.
pub fn manual_config() -> QueueConfig {
    QueueConfig {
        auto_sync: false,
        batch_pause_ms: 0,
        stabilization_delay_ms: 20,
        cleanup_interval_ms: None,
        retry: RetryConfig::new([Duration::from_millis(30)]),
        ..QueueConfig::default()
    }
}

/// Config for tests that rely on automatic triggers.
pub fn auto_config() -> QueueConfig {
    QueueConfig {
        auto_sync: true,
        ..manual_config()
    }
}

pub async fn open(
    store: Arc<dyn SnapshotStore>,
    endpoint: Arc<ScriptedEndpoint>,
    config: QueueConfig,
) -> TransactionQueue {
    QueueBuilder::new(store, endpoint)
        .with_config(config)
        .build()
        .await
        .unwrap()
}

pub async fn open_in_memory(endpoint: Arc<ScriptedEndpoint>) -> TransactionQueue {
    open(Arc::new(MemoryStore::new()), endpoint, manual_config()).await
}

pub fn payment(amount: u64) -> NewTransaction {
    NewTransaction::new(
        TransactionKind::Payment,
        json!({"amount": amount, "currency": "USD"}),
    )
}

/// Receive events until `stop` matches one, failing after `timeout`.
pub async fn collect_until<F>(
    rx: &mut broadcast::Receiver<QueueEvent>,
    timeout: Duration,
    mut stop: F,
) -> Vec<QueueEvent>
where
    F: FnMut(&QueueEvent) -> bool,
{
    let mut seen = Vec::new();
    let finished = tokio::time::timeout(timeout, async {
        loop {
            let event = rx.recv().await.unwrap();
            let done = stop(&event);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await;

    if finished.is_err() {
        panic!("timed out; events so far: {:#?}", seen);
    }
    seen
}
