//! End-to-end pipeline scenarios on in-memory backends with a manual clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use dueline_core::app::{App, AppBuilder, PipelineConfig, RetryPolicy, WorkOutcome};
use dueline_core::domain::{HandlerError, IndexError, TaskId, TaskStatus};
use dueline_core::impls::{InMemoryReadyIndex, InMemoryTaskStore};
use dueline_core::ports::{Clock, FixedClock, ReadyEntry, ReadyIndex, TaskStore};
use dueline_core::typed::{Handler, PayloadCodec, TypedTask};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Email {
    to: String,
}

impl TypedTask for Email {
    const TYPE: &'static str = "email";
}

/// Records how many tasks were RUNNING while the handler ran.
struct EmailHandler {
    store: Arc<InMemoryTaskStore>,
    seen: Mutex<Vec<(String, usize)>>,
    failures_left: AtomicU32,
}

#[async_trait]
impl Handler<Email> for EmailHandler {
    async fn handle(&self, task: Email) -> Result<(), HandlerError> {
        let running = self
            .store
            .counts()
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))?
            .running;
        self.seen.lock().await.push((task.to, running));

        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HandlerError::failed("smtp 451"));
        }
        Ok(())
    }
}

/// Ready index that can be switched off to simulate an outage.
struct FlakyIndex {
    inner: InMemoryReadyIndex,
    down: AtomicBool,
}

impl FlakyIndex {
    fn new() -> Self {
        Self {
            inner: InMemoryReadyIndex::new(),
            down: AtomicBool::new(false),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), IndexError> {
        if self.down.load(Ordering::SeqCst) {
            Err(IndexError::unavailable("connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ReadyIndex for FlakyIndex {
    async fn schedule(&self, task_id: TaskId, due_at: DateTime<Utc>) -> Result<(), IndexError> {
        self.check()?;
        self.inner.schedule(task_id, due_at).await
    }

    async fn pull_due(&self, now: DateTime<Utc>) -> Result<Vec<ReadyEntry>, IndexError> {
        self.check()?;
        self.inner.pull_due(now).await
    }

    async fn peek_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReadyEntry>, IndexError> {
        self.check()?;
        self.inner.peek_due(now, limit).await
    }

    async fn remove_due(&self, entries: &[ReadyEntry]) -> Result<usize, IndexError> {
        self.check()?;
        self.inner.remove_due(entries).await
    }

    async fn contains(&self, task_id: TaskId) -> Result<bool, IndexError> {
        self.check()?;
        self.inner.contains(task_id).await
    }

    async fn len(&self) -> Result<usize, IndexError> {
        self.check()?;
        self.inner.len().await
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

struct Harness {
    app: App,
    clock: FixedClock,
    store: Arc<InMemoryTaskStore>,
    index: Arc<FlakyIndex>,
    handler: Arc<EmailHandler>,
}

struct SharedHandler(Arc<EmailHandler>);

#[async_trait]
impl Handler<Email> for SharedHandler {
    async fn handle(&self, task: Email) -> Result<(), HandlerError> {
        self.0.handle(task).await
    }
}

fn harness(retry: RetryPolicy, failures: u32) -> Harness {
    let clock = FixedClock::new(start());
    let store = Arc::new(InMemoryTaskStore::new());
    let index = Arc::new(FlakyIndex::new());
    let handler = Arc::new(EmailHandler {
        store: store.clone(),
        seen: Mutex::new(Vec::new()),
        failures_left: AtomicU32::new(failures),
    });

    let config = PipelineConfig {
        retry,
        store_retry_delay: Duration::from_millis(1),
        ..PipelineConfig::default()
    };
    let app = AppBuilder::new()
        .store(store.clone())
        .index(index.clone())
        .in_memory()
        .clock(Arc::new(clock.clone()))
        .config(config)
        .register::<Email, _>(SharedHandler(handler.clone()))
        .unwrap()
        .expect_tasks(&["email"])
        .build()
        .unwrap();

    Harness {
        app,
        clock,
        store,
        index,
        handler,
    }
}

async fn submit(h: &Harness, to: &str, in_secs: i64) -> TaskId {
    let sub = PayloadCodec::submission(
        &Email { to: to.to_string() },
        h.clock.now() + chrono::Duration::seconds(in_secs),
    )
    .unwrap();
    h.app.ingestor().submit(sub).await.unwrap().task_id
}

async fn status(h: &Harness, id: TaskId) -> TaskStatus {
    h.store.get(id).await.unwrap().status
}

#[tokio::test]
async fn email_due_in_one_second_runs_after_the_next_tick() {
    let h = harness(RetryPolicy::no_retry(), 0);
    let id = submit(&h, "a@b.com", 1).await;
    let dispatcher = h.app.dispatcher();
    let worker = h.app.worker("w0");

    assert_eq!(dispatcher.tick().await.unwrap().published, 0);
    assert_eq!(worker.run_once(Duration::ZERO).await.unwrap(), None);
    assert_eq!(status(&h, id).await, TaskStatus::Pending);

    h.clock.advance(chrono::Duration::seconds(2));
    assert_eq!(dispatcher.tick().await.unwrap().published, 1);
    assert_eq!(status(&h, id).await, TaskStatus::Scheduled);

    assert_eq!(
        worker.run_once(Duration::ZERO).await.unwrap(),
        Some(WorkOutcome::Completed)
    );
    assert_eq!(status(&h, id).await, TaskStatus::Completed);

    let seen = h.handler.seen.lock().await;
    assert_eq!(seen.as_slice(), &[("a@b.com".to_string(), 1)]);
}

#[tokio::test]
async fn past_execute_at_is_promoted_on_first_tick() {
    let h = harness(RetryPolicy::no_retry(), 0);
    let id = submit(&h, "late@b.com", -3600).await;

    let report = h.app.dispatcher().tick().await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(h.app.queue().depth().await.unwrap().ready, 1);
    assert_eq!(status(&h, id).await, TaskStatus::Scheduled);
}

#[tokio::test]
async fn index_outage_during_poll_is_survived() {
    let h = harness(RetryPolicy::no_retry(), 0);
    let id = submit(&h, "a@b.com", 0).await;
    let dispatcher = h.app.dispatcher();

    h.index.set_down(true);
    assert!(dispatcher.tick().await.is_err());
    assert_eq!(status(&h, id).await, TaskStatus::Pending);

    h.index.set_down(false);
    assert_eq!(dispatcher.tick().await.unwrap().published, 1);
    let outcome = h.app.worker("w0").run_once(Duration::ZERO).await.unwrap();
    assert_eq!(outcome, Some(WorkOutcome::Completed));
}

#[tokio::test]
async fn reconciliation_closes_the_ingest_gap() {
    let h = harness(RetryPolicy::no_retry(), 0);
    h.index.set_down(true);
    let id = submit(&h, "a@b.com", 0).await;
    h.index.set_down(false);

    assert_eq!(h.app.dispatcher().tick().await.unwrap().due, 0);
    assert_eq!(h.app.reconciler().sweep().await.unwrap(), 0);

    h.clock.advance(chrono::Duration::seconds(61));
    assert_eq!(h.app.reconciler().sweep().await.unwrap(), 1);
    assert_eq!(h.app.dispatcher().tick().await.unwrap().published, 1);
    h.app.worker("w0").run_once(Duration::ZERO).await.unwrap();
    assert_eq!(status(&h, id).await, TaskStatus::Completed);
}

#[tokio::test]
async fn failure_without_retry_is_failed_and_not_redelivered() {
    let h = harness(RetryPolicy::no_retry(), 1);
    let id = submit(&h, "a@b.com", 0).await;
    h.app.dispatcher().tick().await.unwrap();

    let outcome = h.app.worker("w0").run_once(Duration::ZERO).await.unwrap();
    assert_eq!(outcome, Some(WorkOutcome::Failed { attempts: 1 }));
    assert_eq!(status(&h, id).await, TaskStatus::Failed);

    let depth = h.app.queue().depth().await.unwrap();
    assert_eq!((depth.ready, depth.in_flight, depth.dead), (0, 0, 1));
    assert_eq!(h.app.index().len().await.unwrap(), 0);
}

#[tokio::test]
async fn failure_is_final_only_after_retry_budget() {
    let h = harness(RetryPolicy::default().with_max_attempts(3), 10);
    let id = submit(&h, "a@b.com", 0).await;
    let dispatcher = h.app.dispatcher();
    let worker = h.app.worker("w0");

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        dispatcher.tick().await.unwrap();
        outcomes.push(worker.run_once(Duration::ZERO).await.unwrap().unwrap());
        if status(&h, id).await == TaskStatus::Running {
            // not due before the backoff elapses
            assert_eq!(dispatcher.tick().await.unwrap().due, 0);
            h.clock.advance(chrono::Duration::seconds(60));
        }
    }

    assert!(matches!(outcomes[0], WorkOutcome::Retrying { attempt: 1, .. }));
    assert!(matches!(outcomes[1], WorkOutcome::Retrying { attempt: 2, .. }));
    assert_eq!(outcomes[2], WorkOutcome::Failed { attempts: 3 });

    let task = h.store.get(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.last_error.as_deref(), Some("smtp 451"));
}

#[tokio::test]
async fn duplicate_delivery_leaves_one_valid_terminal_record() {
    let h = harness(RetryPolicy::no_retry(), 0);
    let id = submit(&h, "a@b.com", 0).await;
    let before = h.store.get(id).await.unwrap();

    // two dispatch passes race and both publish
    h.app.queue().publish(id).await.unwrap();
    h.app.queue().publish(id).await.unwrap();

    let w1 = h.app.worker("w1");
    let w2 = h.app.worker("w2");
    let (a, b) = tokio::join!(w1.run_once(Duration::ZERO), w2.run_once(Duration::ZERO));
    let outcomes = [a.unwrap().unwrap(), b.unwrap().unwrap()];
    assert!(outcomes.contains(&WorkOutcome::Completed));

    let after = h.store.get(id).await.unwrap();
    assert!(after.same_identity(&before));
    assert_eq!(after.status, TaskStatus::Completed);
    assert_eq!(h.app.queue().depth().await.unwrap().in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatchers_remove_each_entry_once() {
    const TASKS: usize = 300;
    const DISPATCHERS: usize = 6;

    let h = harness(RetryPolicy::no_retry(), 0);
    let mut ids = Vec::with_capacity(TASKS);
    for i in 0..TASKS {
        ids.push(submit(&h, &format!("u{i}@b.com"), -(i as i64 % 10)).await);
    }

    let app = Arc::new(h.app);
    let mut handles = Vec::new();
    for _ in 0..DISPATCHERS {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            let dispatcher = app.dispatcher();
            let mut published = 0;
            let mut removed = 0;
            loop {
                let report = dispatcher.tick().await.unwrap();
                published += report.published;
                removed += report.removed;
                if report.due == 0 {
                    break;
                }
            }
            (published, removed)
        }));
    }

    let mut published = 0;
    let mut removed = 0;
    for handle in handles {
        let (p, r) = handle.await.unwrap();
        published += p;
        removed += r;
    }

    assert_eq!(removed, TASKS);
    assert!(published >= TASKS);
    assert_eq!(app.index().len().await.unwrap(), 0);
    assert_eq!(app.queue().depth().await.unwrap().ready, published);
}
