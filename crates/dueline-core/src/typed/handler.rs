//! Handler trait - TypedTask を実行する Handler の定義
//!
//! - `Handler<T>`: 型付きの表層。`T` しか受け取れない
//! - `TypedHandler<T, H>`: payload を JSON で `T` に復元して `Handler<T>` を呼ぶ
//!   アダプタ。`TaskHandler`（bytes レベル）として registry に格納できる

use std::marker::PhantomData;

use async_trait::async_trait;

use super::codec::PayloadCodec;
use super::task::TypedTask;
use crate::app::TaskHandler;
use crate::domain::{HandlerError, Task};

/// Handler は TypedTask を実行する
///
/// # 使用例
/// ```ignore
/// struct SendEmailHandler;
///
/// #[async_trait]
/// impl Handler<SendEmail> for SendEmailHandler {
///     async fn handle(&self, task: SendEmail) -> Result<(), HandlerError> {
///         mailer.send(&task.to).await.map_err(|e| HandlerError::failed(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: TypedTask>: Send + Sync {
    async fn handle(&self, task: T) -> Result<(), HandlerError>;
}

pub struct TypedHandler<T: TypedTask, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TypedTask, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TypedTask, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        let decoded: T = PayloadCodec::decode(&task.payload)?;
        self.handler.handle(decoded).await
    }
}
