//! TaskStore port - タスクの正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - タスクレコード（不変フィールド + status / attempts / last_error）
//! - 状態遷移の検証（条件付き書き込み）
//!
//! # 実装
//! - InMemoryTaskStore（テスト・standalone 用）
//! - RedisTaskStore（feature `redis`）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{StatusChange, StoreError, Task, TaskId, TaskStatus};

/// TaskStore はタスクの状態の正本
///
/// # 設計原則
/// - `update_status` は無条件の上書きではなく、現在の status が
///   `change.to.allowed_predecessors()` に含まれる場合だけ書き込む
/// - 複数 worker が同じ task_id を同時に処理しうるので、単一 writer を仮定しない
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new `Pending` record. Fails with `DuplicateId` if the id exists.
    async fn create(&self, task: &Task) -> Result<(), StoreError>;

    async fn get(&self, id: TaskId) -> Result<Task, StoreError>;

    /// Conditionally apply `change`; returns the status the record held before the write.
    async fn update_status(
        &self,
        id: TaskId,
        change: StatusChange,
    ) -> Result<TaskStatus, StoreError>;

    /// `Pending` records created strictly before `created_before`, oldest
    /// first (ties broken by id).
    ///
    /// `after` resumes behind the last record of a previous page, so a caller
    /// can walk every pending record one page at a time.
    async fn list_pending(
        &self,
        created_before: DateTime<Utc>,
        after: Option<PendingCursor>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    async fn counts(&self) -> Result<StatusCounts, StoreError>;
}

/// Position in the `list_pending` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCursor {
    pub created_at: DateTime<Utc>,
    pub task_id: TaskId,
}

impl PendingCursor {
    /// Cursor pointing just behind `task`.
    pub fn after(task: &Task) -> Self {
        Self {
            created_at: task.created_at,
            task_id: task.id,
        }
    }
}

/// Number of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub scheduled: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, n: usize) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Scheduled => self.scheduled += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
        }
    }

    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Scheduled => self.scheduled,
            TaskStatus::Running => self.running,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.scheduled + self.running + self.completed + self.failed
    }
}
