//! Queue configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use txqueue_common::{Error, Result};

use crate::conflict::InvalidPolicy;
use crate::retry::RetryConfig;

/// Configuration for a `TransactionQueue`. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound on stored transactions, terminal ones included.
    pub max_queue_size: usize,
    /// Transactions submitted concurrently per batch.
    pub batch_size: usize,
    /// Pause between consecutive batches of a cycle.
    pub batch_pause_ms: u64,
    /// Retry budget for transactions that do not set their own.
    pub default_max_retries: u32,
    pub retry: RetryConfig,
    /// How long connectivity must hold before a reconnect sync starts.
    pub stabilization_delay_ms: u64,
    /// Age after which completed transactions are cleaned up.
    pub retention_days: u32,
    /// Interval of the background cleanup task. `None` disables it.
    pub cleanup_interval_ms: Option<u64>,
    /// Interval of the background sync task. `None` disables it.
    pub sync_interval_ms: Option<u64>,
    /// Start a sync cycle on enqueue and when a retry becomes due.
    pub auto_sync: bool,
    pub invalid_policy: InvalidPolicy,
    /// Buffer of the broadcast event channel.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            batch_size: 10,
            batch_pause_ms: 100,
            default_max_retries: 3,
            retry: RetryConfig::default(),
            stabilization_delay_ms: 1000,
            retention_days: 7,
            cleanup_interval_ms: Some(3_600_000),
            sync_interval_ms: None,
            auto_sync: true,
            invalid_policy: InvalidPolicy::FailFast,
            event_capacity: 1024,
        }
    }
}

impl QueueConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(Error::InvalidInput(
                "max_queue_size must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be at least 1".to_string()));
        }
        if self.cleanup_interval_ms == Some(0) || self.sync_interval_ms == Some(0) {
            return Err(Error::InvalidInput(
                "background intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn stabilization_delay(&self) -> Duration {
        Duration::from_millis(self.stabilization_delay_ms)
    }

    pub fn cleanup_interval(&self) -> Option<Duration> {
        self.cleanup_interval_ms.map(Duration::from_millis)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval_ms.map(Duration::from_millis)
    }
}
