//! Redis ready index: one sorted set, member = task id, score = due ms.

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{KeySpace, boxed};
use crate::domain::{IndexError, TaskId};
use crate::ports::{ReadyEntry, ReadyIndex};

/// Fetch and remove everything due in one step.
///
/// KEYS[1] = ready set, ARGV[1] = now ms.
/// Returns a flat `[member, score, member, score, ...]` array.
const LUA_PULL_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'WITHSCORES')
for i = 1, #due, 2 do
    redis.call('ZREM', KEYS[1], due[i])
end
return due
"#;

/// Remove members whose score still equals the peeked score.
///
/// KEYS[1] = ready set, ARGV = `[member, score, member, score, ...]`.
/// Returns the number of members removed.
const LUA_REMOVE_DUE: &str = r#"
local removed = 0
for i = 1, #ARGV, 2 do
    local score = redis.call('ZSCORE', KEYS[1], ARGV[i])
    if score and tonumber(score) == tonumber(ARGV[i + 1]) then
        removed = removed + redis.call('ZREM', KEYS[1], ARGV[i])
    end
end
return removed
"#;

#[derive(Debug, Clone)]
pub struct RedisReadyIndex {
    conn: MultiplexedConnection,
    keys: KeySpace,
}

impl RedisReadyIndex {
    pub fn new(conn: MultiplexedConnection, keys: KeySpace) -> Self {
        Self { conn, keys }
    }
}

fn unavailable(err: ::redis::RedisError) -> IndexError {
    IndexError::Unavailable {
        message: err.to_string(),
        source: boxed(err),
    }
}

/// Turn `(member, score)` pairs into entries, skipping members that are not task ids.
fn entries(pairs: Vec<(String, f64)>) -> Vec<ReadyEntry> {
    pairs
        .into_iter()
        .filter_map(|(member, score)| match member.parse::<TaskId>() {
            Ok(task_id) => Some(ReadyEntry {
                task_id,
                score: score as i64,
            }),
            Err(e) => {
                tracing::warn!(member = %member, error = %e, "ignoring malformed ready index member");
                None
            }
        })
        .collect()
}

#[async_trait]
impl ReadyIndex for RedisReadyIndex {
    async fn schedule(&self, task_id: TaskId, due_at: DateTime<Utc>) -> Result<(), IndexError> {
        let _: i64 = self
            .conn
            .clone()
            .zadd(self.keys.ready(), task_id.to_string(), due_at.timestamp_millis())
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn pull_due(&self, now: DateTime<Utc>) -> Result<Vec<ReadyEntry>, IndexError> {
        let script = Script::new(LUA_PULL_DUE);
        let pairs: Vec<(String, f64)> = script
            .key(self.keys.ready())
            .arg(now.timestamp_millis())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(unavailable)?;
        Ok(entries(pairs))
    }

    async fn peek_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReadyEntry>, IndexError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let pairs: Vec<(String, f64)> = ::redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.ready())
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(unavailable)?;
        Ok(entries(pairs))
    }

    async fn remove_due(&self, entries: &[ReadyEntry]) -> Result<usize, IndexError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let script = Script::new(LUA_REMOVE_DUE);
        let mut invocation = script.key(self.keys.ready());
        for entry in entries {
            invocation.arg(entry.task_id.to_string()).arg(entry.score);
        }
        let removed: i64 = invocation
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(unavailable)?;
        Ok(removed.max(0) as usize)
    }

    async fn contains(&self, task_id: TaskId) -> Result<bool, IndexError> {
        let score: Option<f64> = self
            .conn
            .clone()
            .zscore(self.keys.ready(), task_id.to_string())
            .await
            .map_err(unavailable)?;
        Ok(score.is_some())
    }

    async fn len(&self) -> Result<usize, IndexError> {
        let n: usize = self
            .conn
            .clone()
            .zcard(self.keys.ready())
            .await
            .map_err(unavailable)?;
        Ok(n)
    }
}
