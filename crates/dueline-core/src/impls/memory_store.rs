//! InMemoryTaskStore - テスト・standalone 用の正本
//!
//! `tokio::sync::Mutex` の中で「現在の status を読む → 検証 → 書く」を
//! 1 つのクリティカルセクションとして行うので、条件付き書き込みになります。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{StatusChange, StoreError, Task, TaskId, TaskStatus};
use crate::ports::{PendingCursor, StatusCounts, TaskStore};

#[derive(Default)]
pub struct InMemoryTaskStore {
    records: Arc<Mutex<HashMap<TaskId, Task>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&task.id) {
            return Err(StoreError::DuplicateId(task.id));
        }
        let mut record = task.clone();
        record.status = TaskStatus::Pending;
        records.insert(task.id, record);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        self.records
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_status(
        &self,
        id: TaskId,
        change: StatusChange,
    ) -> Result<TaskStatus, StoreError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let from = record.status;
        if !TaskStatus::can_transition(from, change.to) {
            return Err(StoreError::InvalidTransition {
                task_id: id,
                from,
                to: change.to,
            });
        }

        record.status = change.to;
        record.updated_at = change.at;
        if change.start_attempt {
            record.attempts += 1;
        }
        if let Some(error) = change.error {
            record.last_error = Some(error);
        }
        Ok(from)
    }

    async fn list_pending(
        &self,
        created_before: DateTime<Utc>,
        after: Option<PendingCursor>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let records = self.records.lock().await;
        let mut pending: Vec<Task> = records
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.created_at < created_before)
            .filter(|t| after.is_none_or(|c| (t.created_at, t.id) > (c.created_at, c.task_id)))
            .cloned()
            .collect();
        pending.sort_by_key(|t| (t.created_at, t.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let records = self.records.lock().await;
        let mut counts = StatusCounts::default();
        for record in records.values() {
            counts.add(record.status, 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn task(created: i64) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            TaskType::new("email"),
            br#"{"to":"a@b.com"}"#.to_vec(),
            at(created + 30),
            at(created),
        )
    }

    #[tokio::test]
    async fn create_then_get_preserves_immutable_fields() {
        let store = InMemoryTaskStore::new();
        let t = task(0);
        store.create(&t).await.unwrap();

        let got = store.get(t.id).await.unwrap();
        assert!(got.same_identity(&t));
        assert_eq!(got.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryTaskStore::new();
        let t = task(0);
        store.create(&t).await.unwrap();
        assert!(matches!(
            store.create(&t).await,
            Err(StoreError::DuplicateId(id)) if id == t.id
        ));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = InMemoryTaskStore::new();
        let id = TaskId::from_ulid(Ulid::new());
        assert!(matches!(store.get(id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn start_attempt_counts_and_terminal_sticks() {
        let store = InMemoryTaskStore::new();
        let t = task(0);
        store.create(&t).await.unwrap();

        let from = store
            .update_status(t.id, StatusChange::start_attempt(at(31)))
            .await
            .unwrap();
        assert_eq!(from, TaskStatus::Pending);

        store
            .update_status(t.id, StatusChange::new(TaskStatus::Completed, at(32)))
            .await
            .unwrap();

        // a late duplicate delivery tries to fail the task
        let err = store
            .update_status(
                t.id,
                StatusChange::new(TaskStatus::Failed, at(33)).with_error("boom"),
            )
            .await
            .unwrap_err();
        assert!(err.is_terminal_conflict());

        let got = store.get(t.id).await.unwrap();
        assert_eq!(got.status, TaskStatus::Completed);
        assert_eq!(got.attempts, 1);
        assert_eq!(got.last_error, None);
        assert_eq!(got.updated_at, at(32));
    }

    #[tokio::test]
    async fn list_pending_filters_by_age_and_status() {
        let store = InMemoryTaskStore::new();
        let old = task(0);
        let older = task(-10);
        let fresh = task(100);
        let running = task(-20);
        for t in [&old, &older, &fresh, &running] {
            store.create(t).await.unwrap();
        }
        store
            .update_status(running.id, StatusChange::start_attempt(at(0)))
            .await
            .unwrap();

        let pending = store.list_pending(at(50), None, 10).await.unwrap();
        let ids: Vec<TaskId> = pending.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![older.id, old.id]);

        let limited = store.list_pending(at(50), None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn list_pending_resumes_after_cursor() {
        let store = InMemoryTaskStore::new();
        let first = task(-30);
        let mut same_instant = vec![task(-20), task(-20)];
        same_instant.sort_by_key(|t| t.id);
        let last = task(-10);
        for t in [&first, &same_instant[0], &same_instant[1], &last] {
            store.create(t).await.unwrap();
        }

        let page = store.list_pending(at(0), None, 2).await.unwrap();
        let ids: Vec<TaskId> = page.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first.id, same_instant[0].id]);

        let cursor = page.last().map(PendingCursor::after);
        let page = store.list_pending(at(0), cursor, 2).await.unwrap();
        let ids: Vec<TaskId> = page.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![same_instant[1].id, last.id]);

        let cursor = page.last().map(PendingCursor::after);
        assert!(store.list_pending(at(0), cursor, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn counts_by_status() {
        let store = InMemoryTaskStore::new();
        let a = task(0);
        let b = task(1);
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();
        store
            .update_status(a.id, StatusChange::new(TaskStatus::Scheduled, at(2)))
            .await
            .unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.scheduled, 1);
        assert_eq!(counts.total(), 2);
    }
}
