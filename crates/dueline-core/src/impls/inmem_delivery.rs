//! InMemoryDeliveryQueue - 開発用の配送キュー
//!
//! # 実装詳細
//! - `tokio::sync::Mutex` で ready / in-flight / dead-letter を排他制御
//! - `Notify` で publish 時に待機中の consumer を起こす
//! - consume したメッセージは `in_flight` に移り、ack / nack / dead_letter
//!   されるまで残る。`recover` で ready の先頭に戻る（consumer クラッシュ相当）

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use ulid::Ulid;

use crate::domain::{DeliveryId, QueueError, TaskId};
use crate::ports::{Clock, DeadLetter, Delivery, DeliveryQueue, QueueDepth, SystemClock};

#[derive(Default)]
struct QueueState {
    /// (task_id, redelivered)
    ready: VecDeque<(TaskId, bool)>,
    /// delivery id -> (consume sequence, task_id)
    in_flight: HashMap<DeliveryId, (u64, TaskId)>,
    dead: Vec<DeadLetter>,
    next_seq: u64,
}

pub struct InMemoryDeliveryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            clock,
        }
    }

    /// Task ids waiting to be consumed, front first.
    pub async fn ready_ids(&self) -> Vec<TaskId> {
        self.state
            .lock()
            .await
            .ready
            .iter()
            .map(|(task_id, _)| *task_id)
            .collect()
    }

    async fn settle(&self, delivery: &Delivery) -> Result<TaskId, QueueError> {
        self.state
            .lock()
            .await
            .in_flight
            .remove(&delivery.id)
            .map(|(_, task_id)| task_id)
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.id.to_string()))
    }
}

impl Default for InMemoryDeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn publish(&self, task_id: TaskId) -> Result<(), QueueError> {
        self.state.lock().await.ready.push_back((task_id, false));
        self.notify.notify_one();
        Ok(())
    }

    async fn consume(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some((task_id, redelivered)) = state.ready.pop_front() {
                    let id = DeliveryId::from_ulid(Ulid::new());
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.in_flight.insert(id, (seq, task_id));
                    return Ok(Some(Delivery {
                        id,
                        task_id,
                        redelivered,
                    }));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // timeout 後にもう一度だけ ready を確認する
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery).await.map(|_| ())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let task_id = self.settle(delivery).await?;
        if requeue {
            self.state.lock().await.ready.push_back((task_id, true));
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let task_id = self.settle(delivery).await?;
        let letter = DeadLetter {
            task_id,
            reason: reason.to_string(),
            at: self.clock.now(),
        };
        self.state.lock().await.dead.push(letter);
        Ok(())
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let recovered = {
            let mut state = self.state.lock().await;
            let mut in_flight: Vec<(u64, TaskId)> =
                state.in_flight.drain().map(|(_, entry)| entry).collect();
            in_flight.sort_by_key(|(seq, _)| *seq);
            for (_, task_id) in in_flight.iter().rev() {
                state.ready.push_front((*task_id, true));
            }
            in_flight.len()
        };
        if recovered > 0 {
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.dead.iter().rev().take(limit).cloned().collect())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let state = self.state.lock().await;
        Ok(QueueDepth {
            ready: state.ready.len(),
            in_flight: state.in_flight.len(),
            dead: state.dead.len(),
        })
    }
}
