//! Ingestor - タスクの受け付け
//!
//! TaskStore に書いてから ReadyIndex に書く（2 つをまたぐトランザクションはない）。
//! ReadyIndex への書き込みが失敗しても、レコードは PENDING のまま残り
//! Reconciler が拾い直すので、呼び出し元には成功を返します。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{PipelineError, StoreError, Submission, Task, TaskId, TaskStatus};
use crate::ports::{Clock, IdGenerator, ReadyIndex, TaskStore};

/// Returned to the client on successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

pub struct Ingestor {
    store: Arc<dyn TaskStore>,
    index: Arc<dyn ReadyIndex>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        index: Arc<dyn ReadyIndex>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            index,
            ids,
            clock,
        }
    }

    /// Validate, persist as PENDING, then insert into the ready index.
    pub async fn submit(&self, submission: Submission) -> Result<Receipt, PipelineError> {
        let task_type = submission.validate()?;
        let task = Task::new(
            self.ids.generate_task_id(),
            task_type,
            submission.payload,
            submission.execute_at,
            self.clock.now(),
        );

        self.store.create(&task).await?;

        if let Err(e) = self.index.schedule(task.id, task.execute_at).await {
            tracing::warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                error = %e,
                "ready index write failed; reconciliation will schedule the task"
            );
        } else {
            tracing::info!(
                task_id = %task.id,
                task_type = %task.task_type,
                execute_at = %task.execute_at,
                "task accepted"
            );
        }

        Ok(Receipt {
            task_id: task.id,
            status: TaskStatus::Pending,
        })
    }

    /// Current record, for status polling.
    pub async fn status(&self, id: TaskId) -> Result<Task, StoreError> {
        self.store.get(id).await
    }
}
