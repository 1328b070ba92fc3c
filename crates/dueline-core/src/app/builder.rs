//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! - Builder パターンで ports・設定・handler を集める
//! - 起動時検証（Fail-fast 設計）: 期待する task_type に handler があるか、
//!   必要な backend がそろっているかを `build()` で確認する

use std::sync::Arc;

use super::config::PipelineConfig;
use super::dispatcher::Dispatcher;
use super::ingest::Ingestor;
use super::reconciler::Reconciler;
use super::runtime::{HandlerRegistry, RegistryError, Runtime, TaskHandler};
use super::status::StatusView;
use super::worker_loop::{Worker, WorkerGroup};
use crate::domain::{PipelineError, TaskType};
use crate::impls::{InMemoryDeliveryQueue, InMemoryReadyIndex, InMemoryTaskStore};
use crate::ports::{
    Clock, DeliveryQueue, IdGenerator, ReadyIndex, SystemClock, TaskStore, UlidGenerator,
};
use crate::typed::{Handler, TypedTask};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .store(store)
///     .index(index)
///     .queue(queue)
///     .register::<SendEmail, _>(SendEmailHandler)?
///     .expect_tasks(&["email"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される task_type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct AppBuilder {
    registry: HandlerRegistry,
    expected_tasks: Option<Vec<String>>,
    store: Option<Arc<dyn TaskStore>>,
    index: Option<Arc<dyn ReadyIndex>>,
    queue: Option<Arc<dyn DeliveryQueue>>,
    in_memory: bool,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("no {0} configured")]
    MissingComponent(&'static str),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            expected_tasks: None,
            store: None,
            index: None,
            queue: None,
            in_memory: false,
            clock: Arc::new(SystemClock),
            config: PipelineConfig::default(),
        }
    }

    /// Typed handler を登録
    pub fn register<T: TypedTask, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    /// bytes レベルの handler を登録
    pub fn register_handler(
        mut self,
        task_type: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(TaskType::new(task_type), handler)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn index(mut self, index: Arc<dyn ReadyIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn DeliveryQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Use in-memory backends for whatever was not set explicitly.
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// AppBuilder を検証して App を生成
    pub fn build(self) -> Result<App, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(&x.as_str()))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let in_memory = self.in_memory;
        let store: Arc<dyn TaskStore> = match self.store {
            Some(store) => store,
            None if in_memory => Arc::new(InMemoryTaskStore::new()),
            None => return Err(BuildError::MissingComponent("task store")),
        };
        let index: Arc<dyn ReadyIndex> = match self.index {
            Some(index) => index,
            None if in_memory => Arc::new(InMemoryReadyIndex::new()),
            None => return Err(BuildError::MissingComponent("ready index")),
        };
        let queue: Arc<dyn DeliveryQueue> = match self.queue {
            Some(queue) => queue,
            None if in_memory => Arc::new(InMemoryDeliveryQueue::with_clock(self.clock.clone())),
            None => return Err(BuildError::MissingComponent("delivery queue")),
        };

        let runtime = Arc::new(Runtime::new(
            Arc::new(self.registry),
            self.config.handler_timeout,
        ));
        Ok(App {
            store,
            index,
            queue,
            ids: Arc::new(UlidGenerator::new(self.clock.clone())),
            clock: self.clock,
            config: self.config,
            runtime,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// App は配線済みの ports と設定を保持し、各ロールを組み立てる
pub struct App {
    store: Arc<dyn TaskStore>,
    index: Arc<dyn ReadyIndex>,
    queue: Arc<dyn DeliveryQueue>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    runtime: Arc<Runtime>,
}

impl App {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        self.runtime.registry()
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<dyn ReadyIndex> {
        &self.index
    }

    pub fn queue(&self) -> &Arc<dyn DeliveryQueue> {
        &self.queue
    }

    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(
            self.store.clone(),
            self.index.clone(),
            self.ids.clone(),
            self.clock.clone(),
        )
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.index.clone(),
            self.queue.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.config.poll_interval,
            self.config.dispatch_batch,
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.store.clone(),
            self.index.clone(),
            self.clock.clone(),
            self.config.reconcile_interval,
            self.config.reconcile_after,
            self.config.reconcile_batch,
        )
    }

    pub fn worker(&self, name: impl Into<String>) -> Worker {
        Worker::new(
            name,
            self.store.clone(),
            self.index.clone(),
            self.queue.clone(),
            self.runtime.clone(),
            self.clock.clone(),
            self.config.retry.clone(),
            self.config.store_retry_delay,
        )
    }

    /// Spawn `config.workers` workers on the shared queue.
    pub fn spawn_workers(&self) -> WorkerGroup {
        let workers = (0..self.config.workers.max(1))
            .map(|i| self.worker(format!("worker-{i}")))
            .collect();
        WorkerGroup::spawn(workers, self.config.consume_wait)
    }

    pub async fn status(&self) -> Result<StatusView, PipelineError> {
        StatusView::collect(
            self.store.as_ref(),
            self.index.as_ref(),
            self.queue.as_ref(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HandlerError;
    use crate::typed::task::fixtures::{AnotherTestTask, TestTask};
    use async_trait::async_trait;

    struct TestTaskHandler;

    #[async_trait]
    impl Handler<TestTask> for TestTaskHandler {
        async fn handle(&self, _task: TestTask) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_build_success() {
        let app = AppBuilder::new()
            .in_memory()
            .register::<TestTask, _>(TestTaskHandler {})
            .unwrap()
            .expect_tasks(&[TestTask::TYPE])
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_missing_task_types() {
        let app = AppBuilder::new()
            .in_memory()
            .register::<TestTask, _>(TestTaskHandler {})
            .unwrap()
            .expect_tasks(&[TestTask::TYPE, AnotherTestTask::TYPE])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec![AnotherTestTask::TYPE.to_string()]
        ));
    }

    #[test]
    fn test_build_no_expect_tasks() {
        let app = AppBuilder::new()
            .in_memory()
            .register::<TestTask, _>(TestTaskHandler {})
            .unwrap()
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_requires_backends() {
        let app = AppBuilder::new()
            .index(Arc::new(InMemoryReadyIndex::new()))
            .queue(Arc::new(InMemoryDeliveryQueue::new()))
            .build();
        assert!(matches!(app, Err(BuildError::MissingComponent("task store"))));
    }

    #[test]
    fn test_double_registration() {
        let result = AppBuilder::new()
            .register::<TestTask, _>(TestTaskHandler {})
            .unwrap()
            .register::<TestTask, _>(TestTaskHandler {});
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn test_app_wires_roles() {
        let app = AppBuilder::new()
            .in_memory()
            .register::<TestTask, _>(TestTaskHandler {})
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(app.registry().registered_types(), vec![TestTask::TYPE]);

        let sub = crate::typed::PayloadCodec::submission(&TestTask { value: 1 }, chrono::Utc::now())
            .unwrap();
        app.ingestor().submit(sub).await.unwrap();
        assert_eq!(app.status().await.unwrap().tasks.pending, 1);
    }
}
