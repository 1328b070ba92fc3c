//! Reconciler - ReadyIndex への書き込み漏れの回収
//!
//! Ingestor は TaskStore → ReadyIndex の順に書くので、間で失敗すると
//! PENDING なのに index に載っていないタスクが残る。
//! 一定時間より古い PENDING タスクのうち index にないものを再スケジュールする。
//! 1 回の sweep で古い PENDING をすべてページングで走査する。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::domain::PipelineError;
use crate::ports::{Clock, PendingCursor, ReadyIndex, TaskStore};

pub struct Reconciler {
    store: Arc<dyn TaskStore>,
    index: Arc<dyn ReadyIndex>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    older_than: Duration,
    batch: usize,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        index: Arc<dyn ReadyIndex>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        older_than: Duration,
        batch: usize,
    ) -> Self {
        Self {
            store,
            index,
            clock,
            interval,
            older_than,
            batch,
        }
    }

    /// One pass; returns how many tasks were put back into the index.
    pub async fn sweep(&self) -> Result<usize, PipelineError> {
        let older_than = chrono::Duration::from_std(self.older_than)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(older_than)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let mut rescheduled = 0;
        let mut after = None;
        loop {
            let page = self
                .store
                .list_pending(cutoff, after, self.batch.max(1))
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(PendingCursor::after(last));

            for task in &page {
                if self.index.contains(task.id).await? {
                    continue;
                }
                self.index.schedule(task.id, task.execute_at).await?;
                rescheduled += 1;
                tracing::info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    created_at = %task.created_at,
                    "rescheduled task missing from the ready index"
                );
            }
        }
        Ok(rescheduled)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => continue,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.sweep().await {
                tracing::error!(error = %e, "reconciliation sweep failed");
            }
        }
    }
}
