//! Redis task store.
//!
//! Each task is a hash with one field per column:
//!
//! | Field | Description |
//! |-------|-------------|
//! | `id`, `type`, `payload` | immutable, `payload` is stored as raw bytes |
//! | `execute_at`, `created_at`, `updated_at` | RFC 3339, nanosecond precision |
//! | `status` | `PENDING`, `SCHEDULED`, ... |
//! | `attempts` | integer, bumped by `HINCRBY` |
//! | `last_error` | only present after a failed attempt |
//!
//! The `pending` sorted set is scored by `created_at` in epoch milliseconds;
//! members with the same score come back in id order.
//!
//! Status writes are compare-and-set: the script reads `status`, checks it
//! against the allowed predecessors passed in `ARGV`, and only then writes.

use std::collections::HashMap;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use super::{KeySpace, boxed};
use crate::domain::{StatusChange, StoreError, Task, TaskId, TaskStatus, TaskType};
use crate::ports::{PendingCursor, StatusCounts, TaskStore};

/// Insert a new record unless the key exists.
///
/// KEYS[1] = task hash, KEYS[2] = pending index, KEYS[3] = counts hash.
/// ARGV[1] = id, ARGV[2] = type, ARGV[3] = payload, ARGV[4] = execute_at,
/// ARGV[5] = created_at, ARGV[6] = created_at ms (pending score).
/// Returns: 1 on insert, 0 if the id already exists.
const LUA_CREATE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1],
    'id', ARGV[1],
    'type', ARGV[2],
    'payload', ARGV[3],
    'status', 'PENDING',
    'execute_at', ARGV[4],
    'created_at', ARGV[5],
    'updated_at', ARGV[5],
    'attempts', '0')
redis.call('ZADD', KEYS[2], tonumber(ARGV[6]), ARGV[1])
redis.call('HINCRBY', KEYS[3], 'PENDING', 1)
return 1
"#;

/// Conditional status write.
///
/// KEYS[1] = task hash, KEYS[2] = pending index, KEYS[3] = counts hash.
/// ARGV[1] = new status, ARGV[2] = space separated allowed predecessors,
/// ARGV[3] = updated_at, ARGV[4] = "1" to count an attempt,
/// ARGV[5] = last error ("" for none), ARGV[6] = task id.
/// Returns: {1, previous} on success, {0, current} if rejected, {-1, ""} if missing.
const LUA_UPDATE_STATUS: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then
    return {-1, ''}
end

local allowed = false
for s in string.gmatch(ARGV[2], '%S+') do
    if s == current then
        allowed = true
    end
end
if not allowed then
    return {0, current}
end

redis.call('HSET', KEYS[1], 'status', ARGV[1], 'updated_at', ARGV[3])
if ARGV[4] == '1' then
    redis.call('HINCRBY', KEYS[1], 'attempts', 1)
end
if ARGV[5] ~= '' then
    redis.call('HSET', KEYS[1], 'last_error', ARGV[5])
end
if current == 'PENDING' and ARGV[1] ~= 'PENDING' then
    redis.call('ZREM', KEYS[2], ARGV[6])
end
if current ~= ARGV[1] then
    redis.call('HINCRBY', KEYS[3], current, -1)
    redis.call('HINCRBY', KEYS[3], ARGV[1], 1)
end
return {1, current}
"#;

/// One page of the pending index in (score, member) order.
///
/// KEYS[1] = pending index.
/// ARGV[1] = exclusive created_at ms upper bound, ARGV[2] = cursor score
/// ("" for the first page), ARGV[3] = cursor member, ARGV[4] = page size.
/// Returns: up to ARGV[4] members strictly after the cursor.
const LUA_LIST_PENDING: &str = r#"
local limit = tonumber(ARGV[4])
local min = '-inf'
if ARGV[2] ~= '' then
    min = ARGV[2]
end

local out = {}
local offset = 0
while #out < limit do
    local page = redis.call('ZRANGEBYSCORE', KEYS[1], min, '(' .. ARGV[1],
        'WITHSCORES', 'LIMIT', offset, limit)
    if #page == 0 then
        break
    end
    for i = 1, #page, 2 do
        local member = page[i]
        if #out < limit and (ARGV[2] == ''
            or tonumber(page[i + 1]) > tonumber(ARGV[2])
            or member > ARGV[3]) then
            table.insert(out, member)
        end
    end
    offset = offset + #page / 2
end
return out
"#;

#[derive(Debug, Clone)]
pub struct RedisTaskStore {
    conn: MultiplexedConnection,
    keys: KeySpace,
}

impl RedisTaskStore {
    pub fn new(conn: MultiplexedConnection, keys: KeySpace) -> Self {
        Self { conn, keys }
    }
}

fn unavailable(err: ::redis::RedisError) -> StoreError {
    StoreError::Unavailable {
        message: err.to_string(),
        source: boxed(err),
    }
}

fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// RFC 3339, or epoch milliseconds for records written before the switch.
fn decode_time(task_id: TaskId, field: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| StoreError::Corrupt {
                task_id,
                message: format!("{field} out of range: {ms}"),
            });
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            task_id,
            message: format!("field {field} is not a timestamp: {e}"),
        })
}

/// Rebuild a [`Task`] from the raw `HGETALL` reply.
fn decode_task(task_id: TaskId, mut fields: HashMap<String, Vec<u8>>) -> Result<Task, StoreError> {
    let text = |fields: &HashMap<String, Vec<u8>>, name: &str| -> Result<String, StoreError> {
        let raw = fields.get(name).ok_or_else(|| StoreError::Corrupt {
            task_id,
            message: format!("missing field {name}"),
        })?;
        String::from_utf8(raw.clone()).map_err(|e| StoreError::Corrupt {
            task_id,
            message: format!("field {name} is not UTF-8: {e}"),
        })
    };
    let number = |fields: &HashMap<String, Vec<u8>>, name: &str| -> Result<i64, StoreError> {
        text(fields, name)?
            .parse::<i64>()
            .map_err(|e| StoreError::Corrupt {
                task_id,
                message: format!("field {name} is not an integer: {e}"),
            })
    };

    let status = text(&fields, "status")?
        .parse::<TaskStatus>()
        .map_err(|e| StoreError::Corrupt {
            task_id,
            message: e.to_string(),
        })?;
    let attempts = u32::try_from(number(&fields, "attempts")?).map_err(|e| StoreError::Corrupt {
        task_id,
        message: format!("attempts: {e}"),
    })?;
    let last_error = match fields.get("last_error") {
        Some(_) => Some(text(&fields, "last_error")?),
        None => None,
    };

    Ok(Task {
        id: task_id,
        task_type: TaskType::new(text(&fields, "type")?),
        payload: fields.remove("payload").unwrap_or_default(),
        status,
        execute_at: decode_time(task_id, "execute_at", &text(&fields, "execute_at")?)?,
        created_at: decode_time(task_id, "created_at", &text(&fields, "created_at")?)?,
        attempts,
        last_error,
        updated_at: decode_time(task_id, "updated_at", &text(&fields, "updated_at")?)?,
    })
}

fn predecessors_arg(to: TaskStatus) -> String {
    to.allowed_predecessors()
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let script = Script::new(LUA_CREATE);
        let inserted: i64 = script
            .key(self.keys.task(task.id))
            .key(self.keys.pending())
            .key(self.keys.counts())
            .arg(task.id.to_string())
            .arg(task.task_type.as_str())
            .arg(task.payload.as_slice())
            .arg(encode_time(task.execute_at))
            .arg(encode_time(task.created_at))
            .arg(task.created_at.timestamp_millis())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(unavailable)?;

        if inserted == 1 {
            Ok(())
        } else {
            Err(StoreError::DuplicateId(task.id))
        }
    }

    async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        let fields: HashMap<String, Vec<u8>> = self
            .conn
            .clone()
            .hgetall(self.keys.task(id))
            .await
            .map_err(unavailable)?;
        if fields.is_empty() {
            return Err(StoreError::NotFound(id));
        }
        decode_task(id, fields)
    }

    async fn update_status(
        &self,
        id: TaskId,
        change: StatusChange,
    ) -> Result<TaskStatus, StoreError> {
        let script = Script::new(LUA_UPDATE_STATUS);
        let (code, status): (i64, String) = script
            .key(self.keys.task(id))
            .key(self.keys.pending())
            .key(self.keys.counts())
            .arg(change.to.as_str())
            .arg(predecessors_arg(change.to))
            .arg(encode_time(change.at))
            .arg(if change.start_attempt { "1" } else { "0" })
            .arg(change.error.as_deref().unwrap_or(""))
            .arg(id.to_string())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(unavailable)?;

        let parse = |s: &str| {
            s.parse::<TaskStatus>().map_err(|e| StoreError::Corrupt {
                task_id: id,
                message: e.to_string(),
            })
        };
        match code {
            1 => parse(&status),
            0 => Err(StoreError::InvalidTransition {
                task_id: id,
                from: parse(&status)?,
                to: change.to,
            }),
            _ => Err(StoreError::NotFound(id)),
        }
    }

    async fn list_pending(
        &self,
        created_before: DateTime<Utc>,
        after: Option<PendingCursor>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let (cursor_score, cursor_member) = match after {
            Some(c) => (c.created_at.timestamp_millis().to_string(), c.task_id.to_string()),
            None => (String::new(), String::new()),
        };
        let script = Script::new(LUA_LIST_PENDING);
        let ids: Vec<String> = script
            .key(self.keys.pending())
            .arg(created_before.timestamp_millis())
            .arg(cursor_score)
            .arg(cursor_member)
            .arg(limit)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(unavailable)?;

        let mut tasks = Vec::with_capacity(ids.len());
        for raw in ids {
            let Ok(id) = raw.parse::<TaskId>() else {
                tracing::warn!(member = %raw, "skipping malformed pending index entry");
                continue;
            };
            match self.get(id).await {
                Ok(task) if task.status == TaskStatus::Pending => tasks.push(task),
                Ok(_) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(tasks)
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let raw: HashMap<String, i64> = self
            .conn
            .clone()
            .hgetall(self.keys.counts())
            .await
            .map_err(unavailable)?;

        let mut counts = StatusCounts::default();
        for (name, n) in raw {
            if let Ok(status) = name.parse::<TaskStatus>() {
                counts.add(status, n.max(0) as usize);
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predecessors_are_space_separated() {
        assert_eq!(predecessors_arg(TaskStatus::Completed), "RUNNING");
        assert_eq!(
            predecessors_arg(TaskStatus::Running),
            "PENDING SCHEDULED RUNNING"
        );
        assert_eq!(predecessors_arg(TaskStatus::Pending), "");
    }

    #[test]
    fn decode_reports_missing_fields() {
        let id = TaskId::from_ulid(ulid::Ulid::new());
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), b"PENDING".to_vec());
        let err = decode_task(id, fields).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn decode_full_record() {
        let id = TaskId::from_ulid(ulid::Ulid::new());
        let mut fields = HashMap::new();
        for (k, v) in [
            ("id", id.to_string()),
            ("type", "email".to_string()),
            ("status", "RUNNING".to_string()),
            ("execute_at", "2025-03-01T09:00:00.123456789Z".to_string()),
            ("created_at", "2025-03-01T08:58:20Z".to_string()),
            ("updated_at", "1740819601000".to_string()),
            ("attempts", "2".to_string()),
            ("last_error", "smtp 451".to_string()),
        ] {
            fields.insert(k.to_string(), v.into_bytes());
        }
        fields.insert("payload".to_string(), vec![0xff, 0x00, 0x7b]);

        let task = decode_task(id, fields).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.payload, vec![0xff, 0x00, 0x7b]);
        assert_eq!(task.last_error.as_deref(), Some("smtp 451"));
        assert_eq!(task.execute_at.timestamp_nanos_opt(), Some(1_740_819_600_123_456_789));
        assert_eq!(task.created_at.timestamp(), 1_740_819_500);
        // epoch-millisecond records still decode
        assert_eq!(task.updated_at.timestamp_millis(), 1_740_819_601_000);
    }

    #[test]
    fn timestamps_keep_nanoseconds() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let encoded = encode_time(at);
        assert_eq!(encoded, "2025-03-01T09:00:00.123456789Z");

        let id = TaskId::from_ulid(ulid::Ulid::new());
        assert_eq!(decode_time(id, "execute_at", &encoded).unwrap(), at);
        assert!(matches!(
            decode_time(id, "execute_at", "yesterday"),
            Err(StoreError::Corrupt { .. })
        ));
    }
}

#[cfg(all(test, feature = "redis-tests"))]
mod redis_tests {
    use super::*;
    use crate::impls::redis::test_support::backend;
    use chrono::Duration;

    async fn store() -> RedisTaskStore {
        let (conn, keys) = backend().await;
        RedisTaskStore::new(conn, keys)
    }

    fn task() -> Task {
        let now = Utc::now();
        Task::new(
            TaskId::from_ulid(ulid::Ulid::new()),
            TaskType::new("email"),
            br#"{"to":"a@b.com"}"#.to_vec(),
            now + Duration::seconds(1),
            now,
        )
    }

    #[tokio::test]
    async fn redis_create_then_get_roundtrips_identity() {
        let store = store().await;
        let mut t = task();
        t.created_at += Duration::nanoseconds(789);
        store.create(&t).await.unwrap();
        let got = store.get(t.id).await.unwrap();
        assert!(got.same_identity(&t));
        assert_eq!(got.execute_at, t.execute_at);
        assert_eq!(got.created_at, t.created_at);
        assert_eq!(got.status, TaskStatus::Pending);
        assert!(matches!(
            store.create(&t).await,
            Err(StoreError::DuplicateId(_))
        ));
    }

    #[tokio::test]
    async fn redis_terminal_status_is_not_overwritten() {
        let store = store().await;
        let t = task();
        store.create(&t).await.unwrap();
        store
            .update_status(t.id, StatusChange::start_attempt(Utc::now()))
            .await
            .unwrap();
        store
            .update_status(t.id, StatusChange::new(TaskStatus::Completed, Utc::now()))
            .await
            .unwrap();
        let err = store
            .update_status(t.id, StatusChange::new(TaskStatus::Failed, Utc::now()))
            .await
            .unwrap_err();
        assert!(err.is_terminal_conflict());

        let got = store.get(t.id).await.unwrap();
        assert_eq!(got.status, TaskStatus::Completed);
        assert_eq!(got.attempts, 1);

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn redis_list_pending_drops_started_tasks() {
        let store = store().await;
        let a = task();
        let b = task();
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();
        store
            .update_status(b.id, StatusChange::new(TaskStatus::Scheduled, Utc::now()))
            .await
            .unwrap();

        let later = Utc::now() + Duration::seconds(5);
        let pending = store.list_pending(later, None, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a.id);
    }

    #[tokio::test]
    async fn redis_list_pending_pages_through_same_millisecond() {
        let store = store().await;
        let created = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let t = Task::new(
                TaskId::from_ulid(ulid::Ulid::new()),
                TaskType::new("noop"),
                Vec::new(),
                created,
                created,
            );
            store.create(&t).await.unwrap();
            ids.push(t.id);
        }
        ids.sort();

        let cutoff = created + Duration::seconds(1);
        let first = store.list_pending(cutoff, None, 2).await.unwrap();
        let second = store
            .list_pending(cutoff, first.last().map(PendingCursor::after), 2)
            .await
            .unwrap();
        let seen: Vec<TaskId> = first.iter().chain(&second).map(|t| t.id).collect();
        assert_eq!(seen, ids);
    }
}
