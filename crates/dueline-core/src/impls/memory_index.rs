//! InMemoryReadyIndex - 開発用の ready インデックス
//!
//! `by_id`（task_id → score）と `by_score`（(score, task_id) の順序集合）を
//! 同じ Mutex の中で更新します。どの操作も 1 回のロックの中で完結するので、
//! `pull_due` は列挙と削除がアトミックになります。

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{IndexError, TaskId};
use crate::ports::{ReadyEntry, ReadyIndex};

#[derive(Default)]
struct IndexState {
    by_id: HashMap<TaskId, i64>,
    by_score: BTreeSet<(i64, TaskId)>,
}

impl IndexState {
    fn insert(&mut self, task_id: TaskId, score: i64) {
        if let Some(old) = self.by_id.insert(task_id, score) {
            self.by_score.remove(&(old, task_id));
        }
        self.by_score.insert((score, task_id));
    }

    fn due(&self, max_score: i64, limit: usize) -> Vec<ReadyEntry> {
        self.by_score
            .iter()
            .take_while(|(score, _)| *score <= max_score)
            .take(limit)
            .map(|&(score, task_id)| ReadyEntry { task_id, score })
            .collect()
    }

    fn remove_if_score(&mut self, entry: &ReadyEntry) -> bool {
        match self.by_id.get(&entry.task_id) {
            Some(&score) if score == entry.score => {
                self.by_id.remove(&entry.task_id);
                self.by_score.remove(&(score, entry.task_id));
                true
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct InMemoryReadyIndex {
    state: Mutex<IndexState>,
}

impl InMemoryReadyIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReadyIndex for InMemoryReadyIndex {
    async fn schedule(&self, task_id: TaskId, due_at: DateTime<Utc>) -> Result<(), IndexError> {
        let entry = ReadyEntry::new(task_id, due_at);
        self.state.lock().await.insert(entry.task_id, entry.score);
        Ok(())
    }

    async fn pull_due(&self, now: DateTime<Utc>) -> Result<Vec<ReadyEntry>, IndexError> {
        let mut state = self.state.lock().await;
        let due = state.due(now.timestamp_millis(), usize::MAX);
        for entry in &due {
            state.remove_if_score(entry);
        }
        Ok(due)
    }

    async fn peek_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReadyEntry>, IndexError> {
        Ok(self.state.lock().await.due(now.timestamp_millis(), limit))
    }

    async fn remove_due(&self, entries: &[ReadyEntry]) -> Result<usize, IndexError> {
        let mut state = self.state.lock().await;
        Ok(entries
            .iter()
            .filter(|entry| state.remove_if_score(entry))
            .count())
    }

    async fn contains(&self, task_id: TaskId) -> Result<bool, IndexError> {
        Ok(self.state.lock().await.by_id.contains_key(&task_id))
    }

    async fn len(&self) -> Result<usize, IndexError> {
        Ok(self.state.lock().await.by_id.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;
    use ulid::Ulid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn pull_due_returns_only_due_entries_and_removes_them() {
        let index = InMemoryReadyIndex::new();
        let (a, b, c) = (id(), id(), id());
        index.schedule(a, at(0)).await.unwrap();
        index.schedule(b, at(10)).await.unwrap();
        index.schedule(c, at(20)).await.unwrap();

        let due = index.pull_due(at(10)).await.unwrap();
        let ids: Vec<TaskId> = due.iter().map(|e| e.task_id).collect();
        assert_eq!(ids, vec![a, b]);

        assert!(!index.contains(a).await.unwrap());
        assert!(index.contains(c).await.unwrap());
        assert!(index.pull_due(at(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nothing_due_is_empty_not_error() {
        let index = InMemoryReadyIndex::new();
        assert!(index.pull_due(at(0)).await.unwrap().is_empty());
        assert!(index.peek_due(at(0), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schedule_overwrites() {
        let index = InMemoryReadyIndex::new();
        let a = id();
        index.schedule(a, at(0)).await.unwrap();
        index.schedule(a, at(100)).await.unwrap();

        assert_eq!(index.len().await.unwrap(), 1);
        assert!(index.peek_due(at(50), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn peek_is_read_only_and_ordered() {
        let index = InMemoryReadyIndex::new();
        let (a, b) = (id(), id());
        index.schedule(b, at(5)).await.unwrap();
        index.schedule(a, at(1)).await.unwrap();

        let peeked = index.peek_due(at(10), 10).await.unwrap();
        assert_eq!(peeked[0].task_id, a);
        assert_eq!(peeked[0].due_at(), at(1));
        assert_eq!(index.len().await.unwrap(), 2);

        assert_eq!(index.peek_due(at(10), 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_due_is_idempotent_and_keeps_rescheduled_entries() {
        let index = InMemoryReadyIndex::new();
        let (a, b) = (id(), id());
        index.schedule(a, at(0)).await.unwrap();
        index.schedule(b, at(0)).await.unwrap();
        let peeked = index.peek_due(at(0), 10).await.unwrap();

        // b is rescheduled between peek and remove
        index.schedule(b, at(60)).await.unwrap();

        assert_eq!(index.remove_due(&peeked).await.unwrap(), 1);
        assert_eq!(index.remove_due(&peeked).await.unwrap(), 0);
        assert!(index.contains(b).await.unwrap());
        assert!(!index.contains(a).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pulls_hand_out_each_entry_once() {
        let index = Arc::new(InMemoryReadyIndex::new());
        let ids: Vec<TaskId> = (0..200).map(|_| id()).collect();
        for (i, task_id) in ids.iter().enumerate() {
            index.schedule(*task_id, at(i as i64 % 7)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let index = Arc::clone(&index);
            handles.push(tokio::spawn(async move { index.pull_due(at(10)).await.unwrap() }));
        }

        let mut seen = Vec::new();
        for h in handles {
            seen.extend(h.await.unwrap().into_iter().map(|e| e.task_id));
        }
        seen.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(seen, expected);
        assert_eq!(index.len().await.unwrap(), 0);
    }
}
