//! 同梱のデモ handler
//!
//! - `email`: 型付き handler（`EmailTask` を JSON から復元してログに出す）
//! - `noop`: bytes レベルの handler（何もしない）

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dueline_core::app::{AppBuilder, RegistryError, TaskHandler};
use dueline_core::domain::{HandlerError, Task};
use dueline_core::typed::{Handler, TypedTask};
use serde::{Deserialize, Serialize};

pub const TASK_TYPES: [&str; 2] = [EmailTask::TYPE, "noop"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTask {
    pub to: String,
    #[serde(default)]
    pub subject: Option<String>,
}

impl TypedTask for EmailTask {
    const TYPE: &'static str = "email";
}

/// Pretends to send mail; `send_time` stands in for the SMTP round trip.
pub struct EmailHandler {
    send_time: Duration,
}

impl EmailHandler {
    pub fn new(send_time: Duration) -> Self {
        Self { send_time }
    }
}

#[async_trait]
impl Handler<EmailTask> for EmailHandler {
    async fn handle(&self, task: EmailTask) -> Result<(), HandlerError> {
        if !task.to.contains('@') {
            return Err(HandlerError::failed(format!(
                "invalid recipient {:?}",
                task.to
            )));
        }
        tokio::time::sleep(self.send_time).await;
        tracing::info!(
            to = %task.to,
            subject = task.subject.as_deref().unwrap_or(""),
            "email sent"
        );
        Ok(())
    }
}

pub struct NoopHandler;

#[async_trait]
impl TaskHandler for NoopHandler {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        tracing::info!(task_id = %task.id, payload_bytes = task.payload.len(), "noop");
        Ok(())
    }
}

/// Register both demo handlers and require them at build time.
pub fn register(builder: AppBuilder) -> Result<AppBuilder, RegistryError> {
    Ok(builder
        .register::<EmailTask, _>(EmailHandler::new(Duration::from_millis(200)))?
        .register_handler("noop", Arc::new(NoopHandler))?
        .expect_tasks(&TASK_TYPES))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn email_rejects_bad_recipient() {
        let handler = EmailHandler::new(Duration::ZERO);
        let err = handler
            .handle(EmailTask {
                to: "nobody".into(),
                subject: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));

        handler
            .handle(EmailTask {
                to: "a@example.com".into(),
                subject: Some("hi".into()),
            })
            .await
            .unwrap();
    }

    #[test]
    fn registers_every_demo_type() {
        let app = register(AppBuilder::new().in_memory()).unwrap().build().unwrap();
        assert_eq!(app.registry().registered_types(), vec!["email", "noop"]);
    }
}
