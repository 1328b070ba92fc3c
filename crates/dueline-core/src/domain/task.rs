use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::ValidationError;
use super::{TaskId, TaskStatus};

/// Longest accepted task type name.
pub const MAX_TASK_TYPE_LEN: usize = 128;

/// Largest accepted payload (1 MiB).
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Selects the handler a worker runs for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Build a task type from untrusted input.
    ///
    /// Accepts ASCII alphanumerics plus `.`, `_`, `-` and `:`.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        if s.trim().is_empty() {
            return Err(ValidationError::EmptyTaskType);
        }
        if s.len() > MAX_TASK_TYPE_LEN {
            return Err(ValidationError::TaskTypeTooLong {
                limit: MAX_TASK_TYPE_LEN,
                actual: s.len(),
            });
        }
        if let Some(bad) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':')))
        {
            return Err(ValidationError::InvalidTaskType {
                task_type: s.to_string(),
                bad,
            });
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A unit of work as submitted by a client, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub task_type: String,
    pub payload: Vec<u8>,
    pub execute_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(
        task_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        execute_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            payload: payload.into(),
            execute_at,
        }
    }

    /// Check the submission and return the parsed task type.
    pub fn validate(&self) -> Result<TaskType, ValidationError> {
        let task_type = TaskType::parse(&self.task_type)?;
        if self.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(ValidationError::PayloadTooLarge {
                limit: MAX_PAYLOAD_BYTES,
                actual: self.payload.len(),
            });
        }
        Ok(task_type)
    }
}

/// The persisted task record.
///
/// `id`, `task_type`, `payload`, `execute_at` and `created_at` never change
/// after `create`. The task store owns every other field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: Vec<u8>,
    pub status: TaskStatus,
    pub execute_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,

    /// Transitions into `Running` that started a new attempt.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A fresh `Pending` record.
    pub fn new(
        id: TaskId,
        task_type: TaskType,
        payload: Vec<u8>,
        execute_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type,
            payload,
            status: TaskStatus::Pending,
            execute_at,
            created_at,
            attempts: 0,
            last_error: None,
            updated_at: created_at,
        }
    }

    /// Immutable fields only; used to check that a stored record was not corrupted.
    pub fn same_identity(&self, other: &Task) -> bool {
        self.id == other.id
            && self.task_type == other.task_type
            && self.payload == other.payload
            && self.execute_at == other.execute_at
            && self.created_at == other.created_at
    }
}
