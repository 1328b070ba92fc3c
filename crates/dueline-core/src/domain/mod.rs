//! Domain model (ids, task record, status state machine, errors).

pub mod errors;
pub mod ids;
pub mod state;
pub mod task;

pub use self::errors::{
    ErrorKind, HandlerError, IndexError, PipelineError, QueueError, StartupError, StoreError,
    ValidationError,
};
pub use self::ids::{DeliveryId, TaskId};
pub use self::state::{StatusChange, TaskStatus};
pub use self::task::{Submission, Task, TaskType};
