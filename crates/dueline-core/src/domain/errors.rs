//! Errors - エラー型と分類
//!
//! 各ポートは自分のエラー型を返し、[`PipelineError`] がそれらを束ねます。
//! [`ErrorKind`] は運用上の扱い（リトライするか、dead-letter に送るか）を決める分類です。

use std::time::Duration;

use thiserror::Error;

use super::{TaskId, TaskStatus, TaskType};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// ErrorKind は実行エラーの分類
///
/// - Validation: 投入内容の不正（同期的に拒否、リトライしない）
/// - Transient: store / index / queue に一時的に到達できない（リトライする）
/// - NotFound: 参照された task がない（そのメッセージにとって終端、dead-letter へ）
/// - Handler: ハンドラの業務エラー（FAILED として記録）
/// - Fatal: 起動時の接続がリトライ上限を超えた（プロセス終了）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Transient,
    NotFound,
    Handler,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("task type must not be empty")]
    EmptyTaskType,

    #[error("task type is {actual} bytes, limit is {limit}")]
    TaskTypeTooLong { limit: usize, actual: usize },

    #[error("task type {task_type:?} contains invalid character {bad:?}")]
    InvalidTaskType { task_type: String, bad: char },

    #[error("payload is {actual} bytes, limit is {limit}")]
    PayloadTooLarge { limit: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} already exists")]
    DuplicateId(TaskId),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("stored record for {task_id} is unreadable: {message}")]
    Corrupt { task_id: TaskId, message: String },

    #[error("task store unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::Corrupt { .. } => ErrorKind::NotFound,
            Self::Unavailable { .. } => ErrorKind::Transient,
            Self::DuplicateId(_) | Self::InvalidTransition { .. } => ErrorKind::Validation,
        }
    }

    /// The record was already terminal, so the write lost a race to a faster delivery.
    pub fn is_terminal_conflict(&self) -> bool {
        matches!(self, Self::InvalidTransition { from, .. } if from.is_terminal())
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("ready index unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl IndexError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("delivery queue unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("delivery {0} is not in flight")]
    UnknownDelivery(String),

    #[error("malformed message body {0:?}")]
    MalformedMessage(String),
}

impl QueueError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler registered for task type {0}")]
    NotRegistered(TaskType),

    #[error("payload decode failed: {0}")]
    Decode(String),

    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Retrying cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NotRegistered(_) | Self::Decode(_))
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{component} unavailable after {attempts} attempts: {message}")]
    Exhausted {
        component: String,
        attempts: u32,
        message: String,
    },
}

/// Umbrella error for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Startup(#[from] StartupError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Store(e) => e.kind(),
            Self::Index(_) | Self::Queue(_) => ErrorKind::Transient,
            Self::Handler(_) => ErrorKind::Handler,
            Self::Startup(_) => ErrorKind::Fatal,
        }
    }
}
