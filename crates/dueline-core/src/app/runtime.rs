use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{HandlerError, Task, TaskType};
use crate::typed::{Handler, TypedHandler, TypedTask};

/// A handler for a specific task type.
///
/// Takes the whole `Task` so the handler can decode the payload as it likes
/// (JSON, raw bytes, ...). The same task may be handed over more than once,
/// so handlers must tolerate re-execution.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for task type '{0}' is already registered")]
    AlreadyRegistered(TaskType),
}

/// Registry of handlers (task_type -> handler).
///
/// Built during initialization (mutable), shared read-only at runtime.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    /// Register a typed handler under `T::TYPE`; the payload is decoded as JSON.
    pub fn register_typed<T: TypedTask, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register(
            TaskType::new(T::TYPE),
            Arc::new(TypedHandler::<T, H>::new(handler)),
        )
    }

    pub fn get(&self, task_type: &TaskType) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_type)
    }

    pub fn registered_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(TaskType::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Runtime executes a `Task` by dispatching to its registered handler,
/// bounded by a timeout.
pub struct Runtime {
    registry: Arc<HandlerRegistry>,
    timeout: Duration,
}

impl Runtime {
    pub fn new(registry: Arc<HandlerRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute one task.
    ///
    /// On timeout the handler future is dropped, which cancels it at its next
    /// await point.
    pub async fn execute(&self, task: &Task) -> Result<(), HandlerError> {
        let handler = self
            .registry
            .get(&task.task_type)
            .ok_or_else(|| HandlerError::NotRegistered(task.task_type.clone()))?;

        match tokio::time::timeout(self.timeout, handler.handle(task)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::TimedOut(self.timeout)),
        }
    }
}
