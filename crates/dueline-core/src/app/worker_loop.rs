//! WorkerLoop - タスク実行ループ
//!
//! # フロー（1 配送）
//! 1. `TaskStore::update_status(RUNNING)` で attempt を数える（best-effort、失敗しても続行）
//! 2. `TaskStore::get()` でレコード取得。ない・読めない → dead-letter。
//!    1 の書き込みが届いておらず RUNNING でなければ、handler の前にもう一度だけ
//!    RUNNING を書く（書けなければ requeue）
//! 3. `Runtime::execute()` で handler 実行（timeout 付き）
//! 4. 成功 → COMPLETED を書いて ack
//!    失敗 → 予算が残っていれば ReadyIndex に `now + backoff` で再登録して ack、
//!    尽きていれば FAILED を書いて dead-letter
//!
//! 同じ task_id が 2 つの worker に同時に届くことがある。TaskStore の
//! 条件付き書き込みが終端状態を守るので、負けた側は ack して捨てるだけ。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::retry::RetryPolicy;
use super::runtime::Runtime;
use crate::domain::{HandlerError, QueueError, StatusChange, StoreError, Task, TaskStatus};
use crate::ports::{Clock, Delivery, DeliveryQueue, ReadyIndex, TaskStore};

/// How one delivery was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Completed,
    /// Handler failed with budget left; the task is back in the ready index.
    Retrying { attempt: u32, delay: Duration },
    /// Handler failed for good; task is FAILED and the message dead-lettered.
    Failed { attempts: u32 },
    /// The message could not be tied to a readable task.
    DeadLettered { reason: String },
    /// The task was already terminal; message acked without running the handler.
    Duplicate { status: TaskStatus },
    /// A dependency was unavailable; the message went back on the queue.
    Requeued,
}

pub struct Worker {
    name: String,
    store: Arc<dyn TaskStore>,
    index: Arc<dyn ReadyIndex>,
    queue: Arc<dyn DeliveryQueue>,
    runtime: Arc<Runtime>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    store_retry_delay: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn TaskStore>,
        index: Arc<dyn ReadyIndex>,
        queue: Arc<dyn DeliveryQueue>,
        runtime: Arc<Runtime>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        store_retry_delay: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            index,
            queue,
            runtime,
            clock,
            retry,
            store_retry_delay,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `wait` for one delivery and process it.
    pub async fn run_once(&self, wait: Duration) -> Result<Option<WorkOutcome>, QueueError> {
        match self.queue.consume(wait).await? {
            Some(delivery) => Ok(Some(self.process(&delivery).await)),
            None => Ok(None),
        }
    }

    /// Resolve one delivery. Never panics and never returns an error: every
    /// failure ends as ack, nack or dead-letter of this message.
    pub async fn process(&self, delivery: &Delivery) -> WorkOutcome {
        let task_id = delivery.task_id;

        match self
            .store
            .update_status(task_id, StatusChange::start_attempt(self.clock.now()))
            .await
        {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                return self.skip_duplicate(delivery, from).await;
            }
            Err(StoreError::NotFound(_)) => {
                return self.dead_letter(delivery, "task not found").await;
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "could not mark RUNNING; continuing");
            }
        }

        let mut task = match self.store.get(task_id).await {
            Ok(task) => task,
            Err(e @ (StoreError::NotFound(_) | StoreError::Corrupt { .. })) => {
                tracing::error!(task_id = %task_id, error = %e, "unreadable task");
                return self.dead_letter(delivery, &e.to_string()).await;
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "task store unavailable; requeueing");
                tokio::time::sleep(self.store_retry_delay).await;
                return self.requeue(delivery).await;
            }
        };
        if task.status.is_terminal() {
            return self.skip_duplicate(delivery, task.status).await;
        }
        if task.status != TaskStatus::Running {
            // COMPLETED is only reachable from RUNNING
            match self
                .store
                .update_status(task_id, StatusChange::start_attempt(self.clock.now()))
                .await
            {
                Ok(_) => {
                    task.status = TaskStatus::Running;
                    task.attempts += 1;
                }
                Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                    return self.skip_duplicate(delivery, from).await;
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "still cannot mark RUNNING; requeueing");
                    tokio::time::sleep(self.store_retry_delay).await;
                    return self.requeue(delivery).await;
                }
            }
        }

        tracing::debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempts,
            redelivered = delivery.redelivered,
            "executing task"
        );
        match self.runtime.execute(&task).await {
            Ok(()) => self.complete(delivery, &task).await,
            Err(err) => self.fail(delivery, &task, err).await,
        }
    }

    async fn complete(&self, delivery: &Delivery, task: &Task) -> WorkOutcome {
        let change = StatusChange::new(TaskStatus::Completed, self.clock.now());
        match self.store.update_status(task.id, change).await {
            Ok(_) => {}
            Err(e) if e.is_terminal_conflict() => {
                tracing::debug!(task_id = %task.id, error = %e, "task finished elsewhere");
            }
            Err(e @ StoreError::Unavailable { .. }) => {
                tracing::warn!(task_id = %task.id, error = %e, "could not record COMPLETED; requeueing");
                return self.requeue(delivery).await;
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "could not record COMPLETED");
                return self.dead_letter(delivery, &e.to_string()).await;
            }
        }

        self.ack(delivery).await;
        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempts,
            "task completed"
        );
        WorkOutcome::Completed
    }

    async fn fail(&self, delivery: &Delivery, task: &Task, err: HandlerError) -> WorkOutcome {
        let message = err.to_string();

        if !err.is_permanent() && self.retry.should_retry(task.attempts) {
            let delay = self.retry.next_delay(task.attempts);
            let now = self.clock.now();
            let due_at =
                now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

            // keep RUNNING, just remember why this attempt failed
            let note = StatusChange::new(TaskStatus::Running, now).with_error(message.clone());
            if let Err(e) = self.store.update_status(task.id, note).await {
                tracing::debug!(task_id = %task.id, error = %e, "could not record attempt error");
            }

            if let Err(e) = self.index.schedule(task.id, due_at).await {
                tracing::warn!(task_id = %task.id, error = %e, "could not schedule retry; requeueing");
                return self.requeue(delivery).await;
            }
            self.ack(delivery).await;
            tracing::warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                attempt = task.attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %message,
                "task failed; retry scheduled"
            );
            return WorkOutcome::Retrying {
                attempt: task.attempts,
                delay,
            };
        }

        let change =
            StatusChange::new(TaskStatus::Failed, self.clock.now()).with_error(message.clone());
        match self.store.update_status(task.id, change).await {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                return self.skip_duplicate(delivery, from).await;
            }
            Err(e @ StoreError::Unavailable { .. }) => {
                tracing::warn!(task_id = %task.id, error = %e, "could not record FAILED; requeueing");
                return self.requeue(delivery).await;
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "could not record FAILED");
            }
        }

        tracing::error!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempts = task.attempts,
            error = %message,
            "task failed"
        );
        if let Err(e) = self.queue.dead_letter(delivery, &message).await {
            tracing::error!(task_id = %task.id, error = %e, "dead-letter failed");
        }
        WorkOutcome::Failed {
            attempts: task.attempts,
        }
    }

    async fn skip_duplicate(&self, delivery: &Delivery, status: TaskStatus) -> WorkOutcome {
        tracing::info!(task_id = %delivery.task_id, status = %status, "duplicate delivery of a finished task");
        self.ack(delivery).await;
        WorkOutcome::Duplicate { status }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> WorkOutcome {
        tracing::error!(task_id = %delivery.task_id, reason, "dead-lettering delivery");
        if let Err(e) = self.queue.dead_letter(delivery, reason).await {
            tracing::error!(task_id = %delivery.task_id, error = %e, "dead-letter failed");
        }
        WorkOutcome::DeadLettered {
            reason: reason.to_string(),
        }
    }

    async fn requeue(&self, delivery: &Delivery) -> WorkOutcome {
        if let Err(e) = self.queue.nack(delivery, true).await {
            tracing::error!(task_id = %delivery.task_id, error = %e, "nack failed");
        }
        WorkOutcome::Requeued
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.ack(delivery).await {
            tracing::error!(task_id = %delivery.task_id, error = %e, "ack failed");
        }
    }
}

/// How `shutdown_and_join` ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub finished: usize,
    /// Workers still busy after the grace period; their deliveries stay in flight.
    pub aborted: usize,
}

/// Worker group handle.
/// - `request_shutdown()` でワーカー全体が新しい配送を取らなくなる
/// - `shutdown_and_join()` で grace 期間まで終了を待ち、残りは abort する
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn one loop per worker.
    pub fn spawn(workers: Vec<Worker>, consume_wait: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = workers
            .into_iter()
            .map(|worker| {
                let rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    worker_loop(worker, consume_wait, rx).await;
                })
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stop taking new deliveries. In-flight handlers keep running.
    pub fn request_shutdown(&self) {
        // receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown, wait up to `grace` for in-flight work, then abort the rest.
    pub async fn shutdown_and_join(self, grace: Duration) -> ShutdownReport {
        self.request_shutdown();
        let deadline = tokio::time::Instant::now() + grace;
        let mut report = ShutdownReport::default();

        for mut join in self.joins {
            match tokio::time::timeout_at(deadline, &mut join).await {
                Ok(_) => report.finished += 1,
                Err(_) => {
                    join.abort();
                    report.aborted += 1;
                }
            }
        }
        if report.aborted > 0 {
            tracing::warn!(aborted = report.aborted, "workers cancelled after grace period");
        }
        report
    }
}

async fn worker_loop(worker: Worker, consume_wait: Duration, shutdown_rx: watch::Receiver<bool>) {
    tracing::info!(worker = worker.name(), "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // consume はキャンセルせず、短い wait ごとに shutdown を確認する
        match worker.run_once(consume_wait).await {
            Ok(Some(outcome)) => {
                tracing::trace!(worker = worker.name(), ?outcome, "delivery resolved");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(worker = worker.name(), error = %e, "consume failed");
                tokio::time::sleep(consume_wait).await;
            }
        }
    }
    tracing::info!(worker = worker.name(), "worker stopped");
}
