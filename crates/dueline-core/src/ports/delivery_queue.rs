//! DeliveryQueue port - 配送キュー
//!
//! DeliveryQueue は task_id のみを流します（状態や payload は含まない）。
//!
//! # 実装
//! - InMemoryDeliveryQueue（テスト・standalone 用）
//! - RedisDeliveryQueue（feature `redis`、信頼性リスト + processing リスト）

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DeliveryId, QueueError, TaskId};

/// A message handed to a consumer. It stays in flight until acked, nacked or dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: DeliveryId,
    pub task_id: TaskId,
    /// The message was in flight at a consumer before and came back through `recover`/`nack`.
    pub redelivered: bool,
}

/// A message moved to the dead-letter destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task_id: TaskId,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub in_flight: usize,
    pub dead: usize,
}

/// DeliveryQueue は task_id を配送するための at-least-once キュー
///
/// # 設計原則
/// - task_id のみを保持（状態・payload は TaskStore）
/// - `publish` は永続化が確認されてから返る
/// - `consume` したメッセージは解決されるまで in-flight（consumer が落ちたら `recover` で戻る）
/// - 順序は best-effort FIFO、重複配送はありうる
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn publish(&self, task_id: TaskId) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next message; `None` on timeout.
    async fn consume(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Permanently remove the message.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return the message for redelivery (`requeue`) or discard it.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Move the message to the dead-letter destination.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;

    /// Put every in-flight message of this consumer back on the queue.
    async fn recover(&self) -> Result<usize, QueueError>;

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}
