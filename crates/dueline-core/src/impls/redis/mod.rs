//! Redis backends for the three ports.
//!
//! # Key Schema
//!
//! | Key Pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `{prefix}:task:{task_id}` | Hash | Task record |
//! | `{prefix}:pending` | Sorted Set | `Pending` task ids scored by creation time (ms) |
//! | `{prefix}:counts` | Hash | Per-status counters |
//! | `{prefix}:ready` | Sorted Set | Ready index, task ids scored by due time (ms) |
//! | `{prefix}:queue` | List | Delivery queue (task id bodies) |
//! | `{prefix}:queue:processing:{consumer}` | List | In-flight messages of one consumer |
//! | `{prefix}:queue:redelivered` | Set | Bodies that went back to the queue after being in flight |
//! | `{prefix}:queue:dead` | List | Dead letters (JSON) |
//!
//! Every multi-key write runs as a Lua script (`redis::Script`), so each one is
//! a single atomic step on the server. All key names come from [`KeySpace`];
//! the ready index uses exactly one key for insertion and removal.

mod index;
mod queue;
mod store;

pub use self::index::RedisReadyIndex;
pub use self::queue::RedisDeliveryQueue;
pub use self::store::RedisTaskStore;

use ::redis::aio::MultiplexedConnection;

use crate::domain::TaskId;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Open a multiplexed connection. Clones share the same TCP connection.
pub async fn connect(url: &str) -> Result<MultiplexedConnection, ::redis::RedisError> {
    let client = ::redis::Client::open(url)?;
    client.get_multiplexed_async_connection().await
}

/// Key names under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn task(&self, id: TaskId) -> String {
        format!("{}:task:{}", self.prefix, id)
    }

    pub fn pending(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    pub fn counts(&self) -> String {
        format!("{}:counts", self.prefix)
    }

    pub fn ready(&self) -> String {
        format!("{}:ready", self.prefix)
    }

    pub fn queue(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    pub fn processing(&self, consumer: &str) -> String {
        format!("{}:queue:processing:{}", self.prefix, consumer)
    }

    pub fn redelivered(&self) -> String {
        format!("{}:queue:redelivered", self.prefix)
    }

    pub fn dead(&self) -> String {
        format!("{}:queue:dead", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("dueline")
    }
}

fn boxed(err: ::redis::RedisError) -> Option<BoxError> {
    Some(Box::new(err))
}
