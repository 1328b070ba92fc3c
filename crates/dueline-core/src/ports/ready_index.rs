//! ReadyIndex port - 実行時刻順のインデックス
//!
//! pending な task_id を due 時刻（ミリ秒のスコア）で並べた集合です。
//! タスクのコピーではなく、スケジュールの射影だけを持ちます。
//!
//! # 実装
//! - InMemoryReadyIndex（テスト・standalone 用）
//! - RedisReadyIndex（feature `redis`、sorted set + Lua）

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::domain::{IndexError, TaskId};

/// One scheduled task id and its due instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadyEntry {
    pub task_id: TaskId,
    /// Due instant as unix epoch milliseconds.
    pub score: i64,
}

impl ReadyEntry {
    pub fn new(task_id: TaskId, due_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            score: due_at.timestamp_millis(),
        }
    }

    pub fn due_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.score)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// ReadyIndex は due 時刻順に task_id を保持
///
/// # 並行性
/// 複数の dispatcher が同じインデックスを共有するので、各操作は任意の
/// インターリーブで正しくなければならない。
/// - `pull_due` は「列挙」と「削除」を 1 つのアトミック操作で行う
/// - `peek_due` + `remove_due` は dispatcher の 2 フェーズプロトコル用。
///   `remove_due` は peek したときのスコアのままのエントリだけを消すので、
///   その間に再スケジュールされたエントリは残る
#[async_trait]
pub trait ReadyIndex: Send + Sync {
    /// Insert or overwrite the entry for `task_id`.
    async fn schedule(&self, task_id: TaskId, due_at: DateTime<Utc>) -> Result<(), IndexError>;

    /// Atomically fetch and remove every entry due at or before `now`.
    /// Returns an empty vec when nothing is due.
    async fn pull_due(&self, now: DateTime<Utc>) -> Result<Vec<ReadyEntry>, IndexError>;

    /// Read-only view of up to `limit` entries due at or before `now`, earliest first.
    async fn peek_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReadyEntry>, IndexError>;

    /// Remove entries that still carry the peeked score. Absent entries are not an error.
    /// Returns how many entries this call actually removed.
    async fn remove_due(&self, entries: &[ReadyEntry]) -> Result<usize, IndexError>;

    async fn contains(&self, task_id: TaskId) -> Result<bool, IndexError>;

    async fn len(&self) -> Result<usize, IndexError>;
}
