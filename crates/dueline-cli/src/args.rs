//! コマンドライン引数と環境変数
//!
//! すべての値は `DUELINE_*` 環境変数でも指定できます（フラグが優先）。

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use dueline_core::app::{PipelineConfig, RetryPolicy, StartupRetry};

#[derive(Debug, Parser)]
#[command(name = "dueline", version, about = "Deferred task scheduling pipeline")]
pub struct Cli {
    #[command(flatten)]
    pub backend: BackendArgs,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Accept submissions over HTTP.
    Api {
        #[arg(long, env = "DUELINE_LISTEN", default_value = "0.0.0.0:8080")]
        listen: SocketAddr,
    },

    /// Promote due tasks onto the delivery queue and run the reconciliation sweep.
    Dispatcher,

    /// Consume deliveries and run handlers.
    Worker {
        /// Names this process's in-flight list; defaults to `<hostname>-<pid>`.
        #[arg(long, env = "DUELINE_CONSUMER")]
        consumer: Option<String>,

        /// Requeue the consumer's in-flight list before starting.
        /// No live process may be using the same consumer name.
        #[arg(long, env = "DUELINE_RECOVER")]
        recover: bool,
    },

    /// All roles in one process on in-memory backends.
    Standalone {
        #[arg(long, env = "DUELINE_LISTEN", default_value = "127.0.0.1:8080")]
        listen: SocketAddr,
    },
}

/// Consumer name unique to this process.
pub fn default_consumer() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker".to_string());
    format!("{host}-{}", std::process::id())
}

/// Redis connection targets.
#[derive(Debug, Clone, Args)]
pub struct BackendArgs {
    #[arg(long, global = true, env = "DUELINE_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Task store target; falls back to `--redis-url`.
    #[arg(long, global = true, env = "DUELINE_STORE_URL")]
    pub store_url: Option<String>,

    /// Ready index target; falls back to `--redis-url`.
    #[arg(long, global = true, env = "DUELINE_INDEX_URL")]
    pub index_url: Option<String>,

    /// Delivery queue target; falls back to `--redis-url`.
    #[arg(long, global = true, env = "DUELINE_QUEUE_URL")]
    pub queue_url: Option<String>,

    /// Replicas that must confirm each publish (`WAIT`); unset skips the check.
    #[arg(long, global = true, env = "DUELINE_QUEUE_WAIT_REPLICAS")]
    pub queue_wait_replicas: Option<u32>,

    #[arg(long, global = true, env = "DUELINE_QUEUE_WAIT_TIMEOUT_MS", default_value_t = 1000)]
    pub queue_wait_timeout_ms: u64,

    #[arg(long, global = true, env = "DUELINE_KEY_PREFIX", default_value = "dueline")]
    pub key_prefix: String,

    #[arg(long, global = true, env = "DUELINE_CONNECT_ATTEMPTS", default_value_t = 20)]
    pub connect_attempts: u32,

    #[arg(long, global = true, env = "DUELINE_CONNECT_DELAY_MS", default_value_t = 2000)]
    pub connect_delay_ms: u64,
}

impl BackendArgs {
    pub fn store_url(&self) -> &str {
        self.store_url.as_deref().unwrap_or(&self.redis_url)
    }

    pub fn index_url(&self) -> &str {
        self.index_url.as_deref().unwrap_or(&self.redis_url)
    }

    pub fn queue_url(&self) -> &str {
        self.queue_url.as_deref().unwrap_or(&self.redis_url)
    }

    /// `(replicas, timeout)` for publish confirmation, if requested.
    pub fn replica_ack(&self) -> Option<(u32, Duration)> {
        self.queue_wait_replicas
            .map(|n| (n, Duration::from_millis(self.queue_wait_timeout_ms)))
    }

    pub fn startup_retry(&self) -> StartupRetry {
        StartupRetry {
            attempts: self.connect_attempts,
            delay: Duration::from_millis(self.connect_delay_ms),
        }
    }
}

/// Loop tunables; anything not given keeps the [`PipelineConfig`] default.
#[derive(Debug, Clone, Args)]
pub struct PipelineArgs {
    #[arg(long, global = true, env = "DUELINE_POLL_INTERVAL_MS", default_value_t = 2000)]
    pub poll_interval_ms: u64,

    #[arg(long, global = true, env = "DUELINE_DISPATCH_BATCH")]
    pub dispatch_batch: Option<usize>,

    #[arg(long, global = true, env = "DUELINE_WORKERS")]
    pub workers: Option<usize>,

    #[arg(long, global = true, env = "DUELINE_HANDLER_TIMEOUT_SECS")]
    pub handler_timeout_secs: Option<u64>,

    #[arg(long, global = true, env = "DUELINE_SHUTDOWN_GRACE_SECS")]
    pub shutdown_grace_secs: Option<u64>,

    #[arg(long, global = true, env = "DUELINE_RECONCILE_INTERVAL_SECS")]
    pub reconcile_interval_secs: Option<u64>,

    #[arg(long, global = true, env = "DUELINE_RECONCILE_AFTER_SECS")]
    pub reconcile_after_secs: Option<u64>,

    /// 1 disables retries.
    #[arg(long, global = true, env = "DUELINE_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,
}

impl PipelineArgs {
    pub fn config(&self) -> PipelineConfig {
        let mut config = PipelineConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            ..PipelineConfig::default()
        };
        if let Some(batch) = self.dispatch_batch {
            config.dispatch_batch = batch;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(secs) = self.handler_timeout_secs {
            config.handler_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.shutdown_grace_secs {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = self.reconcile_interval_secs {
            config.reconcile_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.reconcile_after_secs {
            config.reconcile_after = Duration::from_secs(secs);
        }
        if let Some(max_attempts) = self.max_attempts {
            config.retry = RetryPolicy::default().with_max_attempts(max_attempts);
        }
        config
    }
}
