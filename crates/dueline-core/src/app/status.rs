//! Status - パイプライン全体の状況
//!
//! TaskStore の status 別件数、ReadyIndex の件数、DeliveryQueue の深さを
//! 1 つにまとめます。`GET /status` と standalone のログで使う。

use serde::{Deserialize, Serialize};

use crate::domain::PipelineError;
use crate::ports::{DeliveryQueue, QueueDepth, ReadyIndex, StatusCounts, TaskStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    pub tasks: StatusCounts,
    /// Entries waiting in the ready index.
    pub ready: usize,
    pub queue: QueueDepth,
}

impl StatusView {
    pub async fn collect(
        store: &dyn TaskStore,
        index: &dyn ReadyIndex,
        queue: &dyn DeliveryQueue,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            tasks: store.counts().await?,
            ready: index.len().await?,
            queue: queue.depth().await?,
        })
    }

    /// Every task reached COMPLETED or FAILED and nothing is left to deliver.
    pub fn is_idle(&self) -> bool {
        self.tasks.pending + self.tasks.scheduled + self.tasks.running == 0
            && self.ready == 0
            && self.queue.ready == 0
            && self.queue.in_flight == 0
    }
}
