//! The transaction queue: owns the state and orchestrates sync cycles.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use txqueue_common::{Error, Result, TransactionId};
use txqueue_storage::SnapshotStore;

use crate::config::QueueConfig;
use crate::conflict::{ConflictRecord, ConflictResolver, Resolution};
use crate::events::{EventBus, EventKind, ListenerId, QueueEvent, SyncTrigger};
use crate::metrics::{ProcessingStats, QueueMetrics};
use crate::network::NetworkMonitor;
use crate::persist::Persister;
use crate::processor::{BatchProcessor, RemoteEndpoint, SubmissionOutcome};
use crate::retry::{RetryDecision, RetryManager};
use crate::scheduler::DependencyScheduler;
use crate::store::{QueueSnapshot, QueueStore};
use crate::timer::{TimerHandle, TimerService};
use crate::transaction::{NewTransaction, Transaction, TransactionFilter, TransactionStatus};
use crate::validation::{AcceptAll, PayloadValidator};

/// Summary of one sync cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncResult {
    /// Transactions the remote side accepted.
    pub successful: Vec<TransactionId>,
    /// Transactions that ended up failed.
    pub failed: Vec<TransactionId>,
    /// Duplicates and rejections reported by the remote side.
    pub conflicts: Vec<ConflictRecord>,
    /// Transactions scheduled for another attempt.
    pub retried: usize,
    /// Batches actually submitted.
    pub batches: usize,
    pub duration: Duration,
}

/// Submission counts of a cycle, used to tell an unreachable endpoint
/// from ordinary per-transaction failures.
#[derive(Debug, Default)]
struct CycleTally {
    submitted: usize,
    transport_errors: usize,
}

/// Builder for `TransactionQueue`.
pub struct QueueBuilder {
    store: Arc<dyn SnapshotStore>,
    endpoint: Arc<dyn RemoteEndpoint>,
    config: QueueConfig,
    validator: Arc<dyn PayloadValidator>,
    network: Option<watch::Receiver<bool>>,
    read_only: bool,
}

impl QueueBuilder {
    pub fn new(store: Arc<dyn SnapshotStore>, endpoint: Arc<dyn RemoteEndpoint>) -> Self {
        Self {
            store,
            endpoint,
            config: QueueConfig::default(),
            validator: Arc::new(AcceptAll),
            network: None,
            read_only: false,
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate payloads at enqueue time.
    pub fn with_validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Follow connectivity reported to `monitor`. Without a monitor the
    /// queue assumes it is always online.
    pub fn with_network(mut self, monitor: &NetworkMonitor) -> Self {
        self.network = Some(monitor.subscribe());
        self
    }

    /// Open the snapshot for inspection only.
    ///
    /// Nothing is recovered, no timers or background tasks run, and every
    /// mutation fails with `Error::ReadOnly` without touching the store.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Load the persisted queue and start the background tasks.
    ///
    /// Transactions that were mid-submission when the previous process
    /// stopped are put back in line, and retry timers are re-armed with
    /// whatever is left of their backoff.
    pub async fn build(self) -> Result<TransactionQueue> {
        self.config.validate()?;
        let persister = Persister::new(self.store);
        let now = Utc::now();

        let mut store = match persister.load().await? {
            Some(snapshot) => {
                info!(
                    "Loaded {} transactions from snapshot of {}",
                    snapshot.transactions.len(),
                    snapshot.last_updated
                );
                QueueStore::from_snapshot(snapshot, self.config.max_queue_size)
            }
            None => QueueStore::new(self.config.max_queue_size),
        };

        let mut recovered = 0;
        for tx in store.iter_mut() {
            if !self.read_only && tx.status() == TransactionStatus::Processing {
                tx.recover_interrupted(now)?;
                recovered += 1;
            }
        }

        let (timers, fired) = TimerService::start();
        let mut retry_timers = HashMap::new();
        for tx in store.iter() {
            if self.read_only || tx.status() != TransactionStatus::Retry {
                continue;
            }
            let remaining = tx
                .estimated_sync_time
                .and_then(|due| (due - now).to_std().ok())
                .unwrap_or(Duration::ZERO);
            retry_timers.insert(tx.id.clone(), timers.schedule(tx.id.clone(), remaining));
        }

        let inner = Arc::new(QueueInner {
            processor: BatchProcessor::new(self.endpoint),
            scheduler: DependencyScheduler::new(self.config.batch_size),
            resolver: ConflictResolver::new(self.config.invalid_policy),
            retry: RetryManager::new(self.config.retry.clone()),
            events: EventBus::new(self.config.event_capacity),
            state: Mutex::new(QueueState {
                store,
                retry_timers,
                stalled: HashSet::new(),
                stats: ProcessingStats::default(),
                version: 0,
            }),
            persister,
            timers,
            validator: self.validator,
            network: self.network,
            read_only: self.read_only,
            sync_in_progress: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
            config: self.config,
        });
        let queue = TransactionQueue { inner };

        if recovered > 0 {
            warn!("Recovered {} interrupted transactions", recovered);
            let mut state = queue.inner.state.lock().await;
            queue.commit(&mut state).await?;
        }

        if !queue.inner.read_only {
            queue.spawn_background_tasks(fired);
        }
        Ok(queue)
    }
}

struct QueueState {
    store: QueueStore,
    /// Outstanding retry timer per transaction in `Retry`.
    retry_timers: HashMap<TransactionId, TimerHandle>,
    /// Transactions already reported as stalled.
    stalled: HashSet<TransactionId>,
    stats: ProcessingStats,
    /// Bumped for every snapshot taken.
    version: u64,
}

impl QueueState {
    fn next_snapshot(&mut self) -> (u64, QueueSnapshot) {
        self.version += 1;
        (self.version, self.store.snapshot())
    }
}

struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    persister: Persister,
    processor: BatchProcessor,
    scheduler: DependencyScheduler,
    resolver: ConflictResolver,
    retry: RetryManager,
    timers: TimerService,
    events: EventBus,
    validator: Arc<dyn PayloadValidator>,
    network: Option<watch::Receiver<bool>>,
    read_only: bool,
    sync_in_progress: AtomicBool,
    shutdown: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl QueueInner {
    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Marks a sync cycle as running for as long as it lives.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Durable queue of transactions awaiting sync to a remote endpoint.
///
/// Cloning is cheap; all clones share one queue.
#[derive(Clone)]
pub struct TransactionQueue {
    inner: Arc<QueueInner>,
}

impl TransactionQueue {
    fn downgrade(&self) -> Weak<QueueInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<QueueInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Whether the queue believes the remote endpoint is reachable.
    pub fn is_online(&self) -> bool {
        self.inner.network.as_ref().map_or(true, |rx| *rx.borrow())
    }

    fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Add a transaction. Returns its newly assigned ID.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if the payload validator refuses the payload
    /// - `Error::QueueFull` if the queue is full of live transactions
    /// - `Error::Shutdown` after `shutdown`
    /// - storage errors if the new state cannot be persisted; the
    ///   transaction is not kept in that case
    pub async fn enqueue(&self, request: NewTransaction) -> Result<TransactionId> {
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }
        self.inner
            .validator
            .validate(request.kind, &request.payload)?;

        let tx = Transaction::new(
            TransactionId::generate(),
            request,
            self.inner.config.default_max_retries,
        );
        let (id, kind, priority) = (tx.id.clone(), tx.kind, tx.priority);

        let mut state = self.inner.state.lock().await;
        let evicted = state.store.insert(tx)?;
        if let Err(e) = self.commit(&mut state).await {
            state.store.remove(&id);
            for tx in evicted {
                state.store.restore(tx);
            }
            return Err(e);
        }
        drop(state);

        for evicted in evicted {
            self.inner
                .events
                .emit(QueueEvent::TransactionRemoved { id: evicted.id });
        }
        debug!("Queued {} transaction {} ({})", kind, id, priority);
        self.inner.events.emit(QueueEvent::TransactionQueued {
            id: id.clone(),
            kind,
            priority,
        });

        if self.inner.config.auto_sync {
            self.trigger(SyncTrigger::Enqueue);
        }
        Ok(id)
    }

    pub async fn get(&self, id: &TransactionId) -> Option<Transaction> {
        self.inner.state.lock().await.store.get(id).cloned()
    }

    /// Transactions matching `filter`, newest first.
    pub async fn list(&self, filter: &TransactionFilter) -> Vec<Transaction> {
        self.inner.state.lock().await.store.list(filter)
    }

    /// Delete a transaction and cancel its retry timer.
    ///
    /// Returns false if it was not queued. A submission already in flight
    /// still completes remotely, but its outcome is discarded.
    pub async fn remove(&self, id: &TransactionId) -> Result<bool> {
        let mut state = self.inner.state.lock().await;

        let Some(tx) = state.store.remove(id) else {
            return Ok(false);
        };
        if let Err(e) = self.commit(&mut state).await {
            state.store.restore(tx);
            return Err(e);
        }
        if state.retry_timers.remove(id).is_some() {
            self.inner.timers.cancel(id);
        }
        state.stalled.remove(id);
        drop(state);

        debug!("Removed transaction {}", id);
        self.inner
            .events
            .emit(QueueEvent::TransactionRemoved { id: id.clone() });
        Ok(true)
    }

    /// Drop completed transactions older than `retention_days`.
    pub async fn cleanup(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));

        let mut state = self.inner.state.lock().await;
        let removed = state.store.cleanup(cutoff);
        if removed.is_empty() {
            return Ok(0);
        }
        let count = removed.len();
        if let Err(e) = self.commit(&mut state).await {
            for tx in removed {
                state.store.restore(tx);
            }
            return Err(e);
        }
        drop(state);

        info!("Cleaned up {} completed transactions", count);
        self.inner
            .events
            .emit(QueueEvent::TransactionsCleaned { count });
        Ok(count)
    }

    pub async fn metrics(&self) -> QueueMetrics {
        let state = self.inner.state.lock().await;
        let store = &state.store;

        let total = store.len();
        let completed = store.count_by_status(TransactionStatus::Completed);
        QueueMetrics {
            total,
            pending: store.count_by_status(TransactionStatus::Pending),
            processing: store.count_by_status(TransactionStatus::Processing),
            retrying: store.count_by_status(TransactionStatus::Retry),
            completed,
            failed: store.count_by_status(TransactionStatus::Failed),
            stalled: DependencyScheduler::find_stalled(store).len(),
            conflicts: state.stats.conflicts,
            average_processing_time_ms: state.stats.average_ms(),
            success_rate: if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64
            },
            last_sync_time: store
                .iter()
                .filter(|tx| tx.status() == TransactionStatus::Completed)
                .map(|tx| tx.timestamp)
                .max(),
        }
    }

    /// Call `handler` for every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    pub fn off(&self, listener: ListenerId) -> bool {
        self.inner.events.off(listener)
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Run a sync cycle now.
    ///
    /// Returns an empty result while offline or while another cycle is
    /// running.
    pub async fn process_queue(&self) -> Result<SyncResult> {
        self.run_sync(SyncTrigger::Manual).await
    }

    /// Stop background tasks and retry timers. Further enqueues and syncs
    /// fail with `Error::Shutdown`.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.timers.shutdown();
        self.inner.abort_tasks();
        info!("Transaction queue shut down");
    }

    /// Persist the current state. Callers hold the state lock across the
    /// write and undo their change if it fails, so memory never runs ahead
    /// of the store.
    async fn commit(&self, state: &mut QueueState) -> Result<()> {
        if self.inner.read_only {
            return Err(Error::ReadOnly);
        }
        let (version, snapshot) = state.next_snapshot();
        self.inner.persister.write(version, &snapshot).await
    }

    /// Start a sync cycle in the background.
    fn trigger(&self, trigger: SyncTrigger) {
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.run_sync(trigger).await {
                debug!("Background sync ({:?}) ended with error: {}", trigger, e);
            }
        });
    }

    async fn run_sync(&self, trigger: SyncTrigger) -> Result<SyncResult> {
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }
        if !self.is_online() {
            debug!("Offline, skipping sync ({:?})", trigger);
            return Ok(SyncResult::default());
        }

        let Some(guard) = SyncGuard::acquire(&self.inner.sync_in_progress) else {
            debug!("Sync already in progress, ignoring {:?} trigger", trigger);
            return Ok(SyncResult::default());
        };

        self.inner.events.emit(QueueEvent::SyncStarted { trigger });
        info!("Starting sync ({:?})", trigger);

        let start = Instant::now();
        let mut result = SyncResult::default();
        let mut tally = CycleTally::default();
        let outcome = self.run_cycle(&mut result, &mut tally).await;
        result.duration = start.elapsed();
        let outcome = outcome.map(|()| (result, tally));
        drop(guard);

        match outcome {
            Ok((result, tally)) => {
                if tally.submitted > 0 && tally.transport_errors == tally.submitted {
                    warn!(
                        "Sync failed: all {} submissions hit transport errors",
                        tally.submitted
                    );
                    self.inner.events.emit(QueueEvent::SyncFailed {
                        error: "endpoint unreachable".to_string(),
                    });
                } else {
                    info!(
                        "Sync completed in {:?}: {} successful, {} failed, {} conflicts, {} retried",
                        result.duration,
                        result.successful.len(),
                        result.failed.len(),
                        result.conflicts.len(),
                        result.retried
                    );
                    self.inner.events.emit(QueueEvent::SyncCompleted {
                        successful: result.successful.len(),
                        failed: result.failed.len(),
                        conflicts: result.conflicts.len(),
                        duration_ms: result.duration.as_millis() as u64,
                    });
                }
                Ok(result)
            }
            Err(e) => {
                error!("Sync failed: {}", e);
                self.inner.events.emit(QueueEvent::SyncFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_cycle(&self, result: &mut SyncResult, tally: &mut CycleTally) -> Result<()> {
        let plan = {
            let state = self.inner.state.lock().await;
            self.inner.scheduler.plan(&state.store, Utc::now())
        };

        for (index, batch) in plan.batches.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.inner.config.batch_pause()).await;
            }
            if self.is_shut_down() {
                break;
            }
            if !self.is_online() {
                info!("Connectivity lost, stopping after {} batches", index);
                break;
            }

            let claimed = self.claim_batch(batch).await?;
            if claimed.is_empty() {
                continue;
            }
            result.batches += 1;

            let outcomes = self.inner.processor.submit_batch(&claimed).await;
            tally.submitted += outcomes.len();
            tally.transport_errors += outcomes
                .iter()
                .filter(|o| matches!(&o.result, Err(e) if e.is_transient()))
                .count();
            self.apply_outcomes(outcomes, result).await?;
        }

        self.report_stalls().await;
        Ok(())
    }

    /// Re-check a planned batch against live state and move every member
    /// that is still eligible to `Processing`.
    ///
    /// If the claim cannot be persisted every member is put back as it was,
    /// so a later cycle can pick it up again.
    async fn claim_batch(&self, ids: &[TransactionId]) -> Result<Vec<Transaction>> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let mut originals = Vec::new();
        let claimed = match claim_eligible(&mut state.store, ids, Utc::now(), &mut originals) {
            Ok(claimed) => claimed,
            Err(e) => {
                restore_all(&mut state.store, originals);
                return Err(e);
            }
        };
        if claimed.is_empty() {
            return Ok(claimed);
        }
        if let Err(e) = self.commit(state).await {
            warn!(
                "Could not persist claim of {} transactions, leaving them queued: {}",
                originals.len(),
                e
            );
            restore_all(&mut state.store, originals);
            return Err(e);
        }

        let mut requeued = Vec::new();
        for tx in originals {
            if tx.status() != TransactionStatus::Retry {
                continue;
            }
            if state.retry_timers.remove(&tx.id).is_some() {
                self.inner.timers.cancel(&tx.id);
            }
            requeued.push(tx.id);
        }
        drop(guard);

        for id in requeued {
            self.inner
                .events
                .emit(QueueEvent::TransactionRequeued { id });
        }
        for tx in &claimed {
            debug!("Submitting transaction {}", tx.id);
            self.inner
                .events
                .emit(QueueEvent::TransactionProcessing { id: tx.id.clone() });
        }
        Ok(claimed)
    }

    /// Fold a batch's outcomes into the queue.
    async fn apply_outcomes(
        &self,
        outcomes: Vec<SubmissionOutcome>,
        result: &mut SyncResult,
    ) -> Result<()> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let now = Utc::now();
        let mut events = Vec::new();

        for outcome in outcomes {
            state.stats.record(outcome.elapsed);
            let id = outcome.id;

            let Some(tx) = state.store.get_mut(&id) else {
                debug!("Transaction {} was removed while in flight", id);
                continue;
            };
            if tx.status() != TransactionStatus::Processing {
                continue;
            }

            match self.inner.resolver.resolve(&id, outcome.result) {
                Resolution::Completed => {
                    tx.mark_completed()?;
                    debug!("Transaction {} completed", id);
                    result.successful.push(id.clone());
                    events.push(QueueEvent::TransactionCompleted { id });
                }
                Resolution::Merged(record) => {
                    tx.mark_completed()?;
                    debug!("Transaction {} already known remotely, merged", id);
                    state.stats.conflicts += 1;
                    events.push(QueueEvent::TransactionConflict {
                        record: record.clone(),
                    });
                    events.push(QueueEvent::TransactionCompleted { id });
                    result.conflicts.push(record);
                }
                Resolution::Rejected(record) => {
                    let error = record
                        .details
                        .clone()
                        .unwrap_or_else(|| "Rejected as invalid by remote".to_string());
                    tx.mark_failed(error.clone())?;
                    warn!("Transaction {} rejected: {}", id, error);
                    state.stats.conflicts += 1;
                    result.failed.push(id.clone());
                    events.push(QueueEvent::TransactionConflict {
                        record: record.clone(),
                    });
                    events.push(QueueEvent::TransactionFailed { id, error });
                    result.conflicts.push(record);
                }
                Resolution::Failed { error } => {
                    tx.mark_failed(error.clone())?;
                    warn!("Transaction {} failed permanently: {}", id, error);
                    result.failed.push(id.clone());
                    events.push(QueueEvent::TransactionFailed { id, error });
                }
                Resolution::Retry { error } => {
                    match self.inner.retry.handle_failure(tx, &error, now)? {
                        RetryDecision::Scheduled {
                            retry_count, delay, ..
                        } => {
                            self.inner.timers.cancel(&id);
                            let handle = self.inner.timers.schedule(id.clone(), delay);
                            state.retry_timers.insert(id.clone(), handle);
                            result.retried += 1;
                            events.push(QueueEvent::TransactionRetryScheduled {
                                id,
                                retry_count,
                                delay_ms: delay.as_millis() as u64,
                            });
                        }
                        RetryDecision::Exhausted { .. } => {
                            result.failed.push(id.clone());
                            events.push(QueueEvent::TransactionFailed { id, error });
                        }
                    }
                }
            }
        }

        // The outcomes happened remotely; report them even if the write fails.
        let persisted = self.commit(state).await;
        drop(guard);
        for event in events {
            self.inner.events.emit(event);
        }
        persisted
    }

    /// Emit `TransactionStalled` for transactions that newly became stuck.
    async fn report_stalls(&self) {
        let newly_stalled = {
            let mut state = self.inner.state.lock().await;
            let found = DependencyScheduler::find_stalled(&state.store);
            let newly: Vec<_> = found
                .iter()
                .filter(|(id, _)| !state.stalled.contains(id))
                .cloned()
                .collect();
            state.stalled = found.into_iter().map(|(id, _)| id).collect();
            newly
        };

        for (id, reason) in newly_stalled {
            warn!("Transaction {} is stalled: {}", id, reason);
            self.inner
                .events
                .emit(QueueEvent::TransactionStalled { id, reason });
        }
    }

    /// A retry timer fired.
    async fn on_retry_due(&self, handle: TimerHandle) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let id = handle.key().clone();

        if state.retry_timers.get(&id) != Some(&handle) {
            trace!("Ignoring superseded retry timer for {}", id);
            return;
        }
        state.retry_timers.remove(&id);

        let Some(tx) = state.store.get_mut(&id) else {
            return;
        };
        if tx.status() != TransactionStatus::Retry {
            return;
        }
        if let Err(e) = tx.mark_requeued() {
            warn!("Could not requeue {}: {}", id, e);
            return;
        }
        // A requeue that is not persisted is redone after a restart: the
        // stored copy is still a due retry.
        if let Err(e) = self.commit(state).await {
            error!("Failed to persist requeue of {}: {}", id, e);
        }
        drop(guard);

        debug!("Transaction {} requeued after backoff", id);
        self.inner
            .events
            .emit(QueueEvent::TransactionRequeued { id });
        if self.inner.config.auto_sync {
            self.trigger(SyncTrigger::RetryDue);
        }
    }

    fn spawn_background_tasks(&self, fired: mpsc::UnboundedReceiver<TimerHandle>) {
        let mut tasks = vec![self.spawn_timer_listener(fired)];
        if let Some(network) = self.inner.network.clone() {
            tasks.push(self.spawn_network_watcher(network));
        }
        if let Some(period) = self.inner.config.cleanup_interval() {
            tasks.push(self.spawn_periodic(period, |queue| async move {
                let days = queue.inner.config.retention_days;
                if let Err(e) = queue.cleanup(days).await {
                    warn!("Periodic cleanup failed: {}", e);
                }
            }));
        }
        if let Some(period) = self.inner.config.sync_interval() {
            tasks.push(self.spawn_periodic(period, |queue| async move {
                if let Err(e) = queue.run_sync(SyncTrigger::Periodic).await {
                    warn!("Periodic sync failed: {}", e);
                }
            }));
        }

        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);
    }

    fn spawn_timer_listener(
        &self,
        mut fired: mpsc::UnboundedReceiver<TimerHandle>,
    ) -> JoinHandle<()> {
        let weak = self.downgrade();
        tokio::spawn(async move {
            while let Some(handle) = fired.recv().await {
                let Some(queue) = Self::upgrade(&weak) else {
                    break;
                };
                queue.on_retry_due(handle).await;
            }
        })
    }

    fn spawn_network_watcher(&self, mut network: watch::Receiver<bool>) -> JoinHandle<()> {
        let weak = self.downgrade();
        tokio::spawn(async move {
            while network.changed().await.is_ok() {
                let online = *network.borrow_and_update();
                let Some(queue) = Self::upgrade(&weak) else {
                    break;
                };

                if !online {
                    queue.inner.events.emit(QueueEvent::NetworkOffline);
                    continue;
                }

                queue.inner.events.emit(QueueEvent::NetworkOnline);
                let delay = queue.inner.config.stabilization_delay();
                drop(queue);

                tokio::time::sleep(delay).await;
                if !*network.borrow() {
                    debug!("Connectivity dropped during stabilization");
                    continue;
                }
                let Some(queue) = Self::upgrade(&weak) else {
                    break;
                };
                queue.trigger(SyncTrigger::Reconnect);
            }
        })
    }

    fn spawn_periodic<F, Fut>(&self, period: Duration, job: F) -> JoinHandle<()>
    where
        F: Fn(TransactionQueue) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let weak = self.downgrade();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(queue) = Self::upgrade(&weak) else {
                    break;
                };
                job(queue).await;
            }
        })
    }
}

/// Move every still-eligible member of `ids` to `Processing`, recording
/// each one's prior state in `originals`.
fn claim_eligible(
    store: &mut QueueStore,
    ids: &[TransactionId],
    now: DateTime<Utc>,
    originals: &mut Vec<Transaction>,
) -> Result<Vec<Transaction>> {
    let mut claimed = Vec::new();
    for id in ids {
        let eligible = {
            let view: &QueueStore = store;
            view.get(id).is_some_and(|tx| {
                DependencyScheduler::is_candidate(tx, now)
                    && DependencyScheduler::dependencies_met(tx, view)
            })
        };
        if !eligible {
            trace!("Transaction {} no longer eligible, leaving it", id);
            continue;
        }
        let Some(tx) = store.get_mut(id) else {
            continue;
        };

        originals.push(tx.clone());
        if tx.status() == TransactionStatus::Retry {
            tx.mark_requeued()?;
        }
        tx.mark_processing()?;
        claimed.push(tx.clone());
    }
    Ok(claimed)
}

fn restore_all(store: &mut QueueStore, originals: Vec<Transaction>) {
    for tx in originals {
        store.restore(tx);
    }
}
