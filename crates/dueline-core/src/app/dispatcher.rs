//! Dispatcher - ReadyIndex から DeliveryQueue への昇格
//!
//! # フロー（1 tick）
//! 1. `ReadyIndex::peek_due()` で due なエントリを読む（読むだけ）
//! 2. 1 件ずつ `DeliveryQueue::publish()`（永続化の確認まで待つ）
//! 3. publish できたエントリだけ `ReadyIndex::remove_due()`
//! 4. TaskStore に SCHEDULED を best-effort で書く
//!
//! 2 と 3 の間で落ちても index にエントリが残るだけなので、次の tick で
//! もう一度 publish される（重複はありうるが、取りこぼしはない）。
//! 複数の Dispatcher が同じ index を共有しても同じ性質が成り立つ。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::domain::{PipelineError, StatusChange, StoreError, TaskStatus};
use crate::ports::{Clock, DeliveryQueue, ReadyEntry, ReadyIndex, TaskStore};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Entries the peek returned.
    pub due: usize,
    pub published: usize,
    /// Publishes that failed; those entries stay in the index.
    pub failed: usize,
    /// Entries this tick removed from the index.
    pub removed: usize,
}

pub struct Dispatcher {
    index: Arc<dyn ReadyIndex>,
    queue: Arc<dyn DeliveryQueue>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    batch: usize,
}

impl Dispatcher {
    pub fn new(
        index: Arc<dyn ReadyIndex>,
        queue: Arc<dyn DeliveryQueue>,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        batch: usize,
    ) -> Self {
        Self {
            index,
            queue,
            store,
            clock,
            poll_interval,
            batch: batch.max(1),
        }
    }

    /// Run one promotion pass.
    ///
    /// Fails only when the index cannot be read or the removal fails; a
    /// failed publish stops the pass and leaves the rest for the next tick.
    pub async fn tick(&self) -> Result<TickReport, PipelineError> {
        let now = self.clock.now();
        let due = self.index.peek_due(now, self.batch).await?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let mut published: Vec<ReadyEntry> = Vec::with_capacity(due.len());
        for entry in &due {
            match self.queue.publish(entry.task_id).await {
                Ok(()) => published.push(*entry),
                Err(e) => {
                    report.failed = due.len() - published.len();
                    tracing::warn!(
                        task_id = %entry.task_id,
                        error = %e,
                        remaining = report.failed,
                        "publish failed; leaving entries for the next tick"
                    );
                    break;
                }
            }
        }
        report.published = published.len();

        if !published.is_empty() {
            report.removed = self.index.remove_due(&published).await?;
        }

        for entry in &published {
            self.mark_scheduled(entry).await;
        }

        tracing::debug!(
            due = report.due,
            published = report.published,
            removed = report.removed,
            "dispatch tick"
        );
        Ok(report)
    }

    async fn mark_scheduled(&self, entry: &ReadyEntry) {
        let change = StatusChange::new(TaskStatus::Scheduled, self.clock.now());
        match self.store.update_status(entry.task_id, change).await {
            Ok(_) => {}
            // already picked up by a worker, or a retry of a RUNNING task
            Err(StoreError::InvalidTransition { from, .. }) => {
                tracing::debug!(task_id = %entry.task_id, status = %from, "not marking SCHEDULED");
            }
            Err(e) => {
                tracing::warn!(task_id = %entry.task_id, error = %e, "failed to mark SCHEDULED");
            }
        }
    }

    /// Tick every `poll_interval` until `shutdown` flips to true.
    ///
    /// A full batch is followed immediately by another tick so a backlog
    /// drains without waiting for the interval. Errors are logged and the
    /// loop carries on.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch = self.batch,
            "dispatcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => continue,
                _ = interval.tick() => {}
            }

            loop {
                match self.tick().await {
                    Ok(report) if report.due == self.batch && report.failed == 0 => continue,
                    Ok(_) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "dispatch tick failed; retrying next tick");
                        break;
                    }
                }
            }
        }
        tracing::info!("dispatcher stopped");
    }
}
