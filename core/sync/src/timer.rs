//! Delayed-task scheduler for retry backoff.
//!
//! A single driver task owns a min-heap of due times. Timers are keyed by
//! transaction ID: scheduling a key again replaces its previous timer, and
//! cancelling a key drops whatever timer it has. Fired timers are delivered
//! as `TimerHandle`s on a channel; each handle carries a generation token so
//! the receiver can tell a current timer from one that was replaced while
//! the notification was in flight.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use txqueue_common::TransactionId;

/// Identifies one scheduled timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    key: TransactionId,
    token: u64,
}

impl TimerHandle {
    /// Transaction this timer belongs to.
    pub fn key(&self) -> &TransactionId {
        &self.key
    }
}

#[derive(Debug)]
enum Command {
    Schedule { handle: TimerHandle, due: Instant },
    Cancel { key: TransactionId },
}

/// Handle to the timer driver task.
pub struct TimerService {
    commands: mpsc::UnboundedSender<Command>,
    next_token: AtomicU64,
    driver: JoinHandle<()>,
}

impl TimerService {
    /// Start the driver task.
    ///
    /// Returns the service and the receiver on which fired timers arrive.
    /// Must be called from within a tokio runtime.
    pub fn start() -> (Self, mpsc::UnboundedReceiver<TimerHandle>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();

        let driver = tokio::spawn(TimerDriver::default().run(command_rx, fired_tx));

        let service = Self {
            commands: command_tx,
            next_token: AtomicU64::new(1),
            driver,
        };
        (service, fired_rx)
    }

    /// Schedule a timer for `key`, replacing any timer it already has.
    pub fn schedule(&self, key: TransactionId, delay: Duration) -> TimerHandle {
        let handle = TimerHandle {
            key,
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
        };
        let due = Instant::now() + delay;

        if self
            .commands
            .send(Command::Schedule {
                handle: handle.clone(),
                due,
            })
            .is_err()
        {
            debug!("Timer driver stopped, dropping timer for {}", handle.key);
        }
        handle
    }

    /// Cancel the timer for `key`, if any.
    pub fn cancel(&self, key: &TransactionId) {
        let _ = self.commands.send(Command::Cancel { key: key.clone() });
    }

    /// Stop the driver. Pending timers never fire.
    pub fn shutdown(&self) {
        self.driver.abort();
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[derive(Default)]
struct TimerDriver {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    /// Current token per key. Heap entries whose token is not current are stale.
    live: HashMap<TransactionId, u64>,
    keys: HashMap<u64, TransactionId>,
}

impl TimerDriver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        fired: mpsc::UnboundedSender<TimerHandle>,
    ) {
        loop {
            let next_due = self.heap.peek().map(|Reverse((due, _))| *due);
            let wake_at = next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Schedule { handle, due }) => self.insert(handle, due),
                    Some(Command::Cancel { key }) => {
                        if self.live.remove(&key).is_some() {
                            trace!("Cancelled timer for {}", key);
                        }
                    }
                    None => break,
                },
                _ = sleep_until(wake_at), if next_due.is_some() => {
                    for handle in self.pop_due(Instant::now()) {
                        if fired.send(handle).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn insert(&mut self, handle: TimerHandle, due: Instant) {
        self.heap.push(Reverse((due, handle.token)));
        self.keys.insert(handle.token, handle.key.clone());
        self.live.insert(handle.key, handle.token);
    }

    fn pop_due(&mut self, now: Instant) -> Vec<TimerHandle> {
        let mut due = Vec::new();

        while let Some(Reverse((at, token))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();

            let Some(key) = self.keys.remove(&token) else {
                continue;
            };
            if self.live.get(&key) == Some(&token) {
                self.live.remove(&key);
                due.push(TimerHandle { key, token });
            }
        }

        due
    }
}
