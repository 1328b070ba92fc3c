//! PipelineConfig - 各ループの設定値

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;

/// Tunables shared by the dispatcher, reconciler and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Dispatcher tick interval; also the promotion latency bound.
    pub poll_interval: Duration,
    /// Max index entries handled per tick.
    pub dispatch_batch: usize,
    /// Concurrent workers per worker process.
    pub workers: usize,
    /// How long a worker waits on an empty queue before checking for shutdown.
    pub consume_wait: Duration,
    pub handler_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Back-off before requeueing a delivery whose task could not be read.
    pub store_retry_delay: Duration,
    pub reconcile_interval: Duration,
    /// Only PENDING tasks older than this are considered lost by the sweep.
    pub reconcile_after: Duration,
    pub reconcile_batch: usize,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            dispatch_batch: 256,
            workers: 4,
            consume_wait: Duration::from_secs(1),
            handler_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            store_retry_delay: Duration::from_millis(500),
            reconcile_interval: Duration::from_secs(30),
            reconcile_after: Duration::from_secs(60),
            reconcile_batch: 256,
            retry: RetryPolicy::default(),
        }
    }
}
