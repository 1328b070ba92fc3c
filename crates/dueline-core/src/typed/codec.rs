//! PayloadCodec - payload bytes と TypedTask の相互変換（JSON）

use chrono::{DateTime, Utc};

use super::task::TypedTask;
use crate::domain::{HandlerError, Submission};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode {task_type}: {source}")]
    Encode {
        task_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("decode {task_type}: {source}")]
    Decode {
        task_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl From<CodecError> for HandlerError {
    fn from(err: CodecError) -> Self {
        HandlerError::Decode(err.to_string())
    }
}

/// JSON codec for typed payloads.
pub struct PayloadCodec;

impl PayloadCodec {
    pub fn encode<T: TypedTask>(task: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(task).map_err(|source| CodecError::Encode {
            task_type: T::TYPE,
            source,
        })
    }

    pub fn decode<T: TypedTask>(payload: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(payload).map_err(|source| CodecError::Decode {
            task_type: T::TYPE,
            source,
        })
    }

    /// Build a submission for `task` due at `execute_at`.
    pub fn submission<T: TypedTask>(
        task: &T,
        execute_at: DateTime<Utc>,
    ) -> Result<Submission, CodecError> {
        Ok(Submission::new(T::TYPE, Self::encode(task)?, execute_at))
    }
}
