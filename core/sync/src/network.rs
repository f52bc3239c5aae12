//! Connectivity tracking.
//!
//! Whatever knows about the network (an OS hook, a health check, a UI toggle)
//! reports transitions through `NetworkMonitor::set_online`. The queue
//! watches the channel and syncs after connectivity comes back.

use tokio::sync::watch;
use tracing::info;

/// Connectivity source shared between its producer and the queue.
#[derive(Debug)]
pub struct NetworkMonitor {
    state: watch::Sender<bool>,
}

impl NetworkMonitor {
    /// Create a monitor with the given initial connectivity.
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self { state }
    }

    /// Report the current connectivity. Repeating the current value is not
    /// a transition and wakes nobody.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            info!(
                "Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
        }
    }

    /// Current connectivity.
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Receiver that observes every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
