//! Redis delivery queue (reliable list pattern).
//!
//! `publish` pushes the task id onto `{prefix}:queue`. `consume` moves the
//! tail element into this consumer's processing list in one `LMOVE`, so a
//! message is never lost between "taken" and "handled". A consumer that died
//! leaves its messages in its processing list; starting it again with the
//! same consumer name and calling `recover` puts them back on the queue.
//!
//! ## 永続性
//! `LPUSH` の応答はメモリ上の書き込みしか保証しない。publish が成功した後に
//! Redis が落ちてもメッセージを失わないためには、サーバ側で
//! `appendonly yes` + `appendfsync always` を設定するか、
//! [`RedisDeliveryQueue::with_replica_ack`] で `WAIT` によるレプリカ確認を有効にする。
//! `WAIT` が足りないと publish はエラーになり、Dispatcher はエントリを index に残す。

use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use tokio::time::Instant;
use ulid::Ulid;

use super::{KeySpace, boxed};
use crate::domain::{DeliveryId, QueueError, TaskId};
use crate::ports::{Clock, DeadLetter, Delivery, DeliveryQueue, QueueDepth, SystemClock};

/// How often `consume` polls an empty queue while waiting.
const POLL_STEP: Duration = Duration::from_millis(50);

/// KEYS[1] = queue, KEYS[2] = processing, KEYS[3] = redelivered set.
/// Returns nil when the queue is empty, otherwise `{body, redelivered}`.
const LUA_CONSUME: &str = r#"
local body = redis.call('LMOVE', KEYS[1], KEYS[2], 'RIGHT', 'LEFT')
if not body then
    return nil
end
local redelivered = redis.call('SREM', KEYS[3], body)
return {body, redelivered}
"#;

/// KEYS[1] = processing, KEYS[2] = queue, KEYS[3] = redelivered set.
/// ARGV[1] = body, ARGV[2] = "1" to requeue.
/// Returns the number of processing entries removed (0 or 1).
const LUA_NACK: &str = r#"
local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
if removed == 1 and ARGV[2] == '1' then
    redis.call('LPUSH', KEYS[2], ARGV[1])
    redis.call('SADD', KEYS[3], ARGV[1])
end
return removed
"#;

/// KEYS[1] = processing, KEYS[2] = dead list.
/// ARGV[1] = body, ARGV[2] = dead letter JSON.
const LUA_DEAD_LETTER: &str = r#"
local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
if removed == 1 then
    redis.call('LPUSH', KEYS[2], ARGV[2])
end
return removed
"#;

/// KEYS[1] = processing, KEYS[2] = queue, KEYS[3] = redelivered set.
/// Oldest in-flight message goes back to the consuming end first.
const LUA_RECOVER: &str = r#"
local n = 0
while true do
    local body = redis.call('LPOP', KEYS[1])
    if not body then
        break
    end
    redis.call('RPUSH', KEYS[2], body)
    redis.call('SADD', KEYS[3], body)
    n = n + 1
end
return n
"#;

#[derive(Clone)]
pub struct RedisDeliveryQueue {
    conn: MultiplexedConnection,
    keys: KeySpace,
    consumer: String,
    clock: Arc<dyn Clock>,
    replica_ack: Option<(u32, Duration)>,
}

impl RedisDeliveryQueue {
    /// `consumer` names this process's processing list; keep it stable across restarts.
    pub fn new(conn: MultiplexedConnection, keys: KeySpace, consumer: impl Into<String>) -> Self {
        Self {
            conn,
            keys,
            consumer: consumer.into(),
            clock: Arc::new(SystemClock),
            replica_ack: None,
        }
    }

    /// Make `publish` wait until `replicas` replicas hold the message.
    pub fn with_replica_ack(mut self, replicas: u32, timeout: Duration) -> Self {
        self.replica_ack = Some((replicas, timeout));
        self
    }

    fn processing(&self) -> String {
        self.keys.processing(&self.consumer)
    }

    async fn try_consume(&self) -> Result<Option<Delivery>, QueueError> {
        loop {
            let script = Script::new(LUA_CONSUME);
            let moved: Option<(String, i64)> = script
                .key(self.keys.queue())
                .key(self.processing())
                .key(self.keys.redelivered())
                .invoke_async(&mut self.conn.clone())
                .await
                .map_err(unavailable)?;

            let Some((body, redelivered)) = moved else {
                return Ok(None);
            };
            match body.parse::<TaskId>() {
                Ok(task_id) => {
                    return Ok(Some(Delivery {
                        id: DeliveryId::from_ulid(Ulid::new()),
                        task_id,
                        redelivered: redelivered == 1,
                    }));
                }
                Err(e) => {
                    tracing::error!(body = %body, error = %e, "dropping malformed queue message");
                    let _: i64 = self
                        .conn
                        .clone()
                        .lrem(self.processing(), 1, &body)
                        .await
                        .map_err(unavailable)?;
                }
            }
        }
    }
}

fn unavailable(err: ::redis::RedisError) -> QueueError {
    QueueError::Unavailable {
        message: err.to_string(),
        source: boxed(err),
    }
}

fn replicated(acked: i64, wanted: u32) -> Result<(), QueueError> {
    if acked >= i64::from(wanted) {
        Ok(())
    } else {
        Err(QueueError::unavailable(format!(
            "publish reached {acked} of {wanted} replicas"
        )))
    }
}

fn resolved(removed: i64, delivery: &Delivery) -> Result<(), QueueError> {
    if removed > 0 {
        Ok(())
    } else {
        Err(QueueError::UnknownDelivery(delivery.id.to_string()))
    }
}

#[async_trait]
impl DeliveryQueue for RedisDeliveryQueue {
    async fn publish(&self, task_id: TaskId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .lpush(self.keys.queue(), task_id.to_string())
            .await
            .map_err(unavailable)?;

        if let Some((replicas, timeout)) = self.replica_ack {
            let acked: i64 = ::redis::cmd("WAIT")
                .arg(replicas)
                .arg(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            if let Err(e) = replicated(acked, replicas) {
                tracing::warn!(task_id = %task_id, acked, replicas, "publish not replicated in time");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn consume(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_consume().await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let removed: i64 = self
            .conn
            .clone()
            .lrem(self.processing(), 1, delivery.task_id.to_string())
            .await
            .map_err(unavailable)?;
        resolved(removed, delivery)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let script = Script::new(LUA_NACK);
        let removed: i64 = script
            .key(self.processing())
            .key(self.keys.queue())
            .key(self.keys.redelivered())
            .arg(delivery.task_id.to_string())
            .arg(if requeue { "1" } else { "0" })
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(unavailable)?;
        resolved(removed, delivery)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let letter = DeadLetter {
            task_id: delivery.task_id,
            reason: reason.to_string(),
            at: self.clock.now(),
        };
        let json = serde_json::to_string(&letter)
            .map_err(|e| QueueError::MalformedMessage(e.to_string()))?;

        let script = Script::new(LUA_DEAD_LETTER);
        let removed: i64 = script
            .key(self.processing())
            .key(self.keys.dead())
            .arg(delivery.task_id.to_string())
            .arg(json)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(unavailable)?;
        resolved(removed, delivery)
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let script = Script::new(LUA_RECOVER);
        let n: i64 = script
            .key(self.processing())
            .key(self.keys.queue())
            .key(self.keys.redelivered())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(unavailable)?;
        Ok(n.max(0) as usize)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw: Vec<String> = self
            .conn
            .clone()
            .lrange(self.keys.dead(), 0, limit as isize - 1)
            .await
            .map_err(unavailable)?;
        raw.iter()
            .map(|s| {
                serde_json::from_str::<DeadLetter>(s)
                    .map_err(|_| QueueError::MalformedMessage(s.clone()))
            })
            .collect()
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut conn = self.conn.clone();
        let ready: usize = conn.llen(self.keys.queue()).await.map_err(unavailable)?;
        let in_flight: usize = conn.llen(self.processing()).await.map_err(unavailable)?;
        let dead: usize = conn.llen(self.keys.dead()).await.map_err(unavailable)?;
        Ok(QueueDepth {
            ready,
            in_flight,
            dead,
        })
    }
}
