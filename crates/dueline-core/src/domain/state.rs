//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Task status.
///
/// State transitions:
/// - Pending -> Scheduled -> Running -> Completed
/// - Pending -> Scheduled -> Running -> Failed
/// - Running -> Running (redelivery after a crash, or a retry waiting in the ready index)
///
/// `Scheduled` means the dispatcher has handed the task id to the delivery
/// queue. A task may skip it (`Pending -> Running`) when a worker picks the
/// message up before the dispatcher records the hand-off.
///
/// Every write goes through [`TaskStatus::can_transition`], so a late
/// duplicate delivery can never move a task out of a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Durably recorded, waiting for its due time.
    Pending,

    /// Published to the delivery queue, not yet picked up.
    Scheduled,

    /// Picked up by a worker (or waiting for a retry).
    Running,

    /// Handler succeeded.
    Completed,

    /// Handler failed and the retry budget is exhausted, or the task is unprocessable.
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Scheduled,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Statuses a record must currently hold for a write of `self` to succeed.
    ///
    /// `Pending` has no predecessors: it is only ever written by `create`.
    pub fn allowed_predecessors(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Pending => &[],
            Scheduled => &[Pending, Scheduled],
            Running => &[Pending, Scheduled, Running],
            Completed => &[Running],
            Failed => &[Pending, Scheduled, Running],
        }
    }

    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        to.allowed_predecessors().contains(&from)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Scheduled => "SCHEDULED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A requested status write.
///
/// Stores validate `to` against the current status before applying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
    /// Recorded as `last_error` when present.
    pub error: Option<String>,
    /// Increment the persisted attempt counter as part of the same write.
    pub start_attempt: bool,
}

impl StatusChange {
    pub fn new(to: TaskStatus, at: DateTime<Utc>) -> Self {
        Self {
            to,
            at,
            error: None,
            start_attempt: false,
        }
    }

    /// Move into `Running` and count a new attempt.
    pub fn start_attempt(at: DateTime<Utc>) -> Self {
        Self {
            start_attempt: true,
            ..Self::new(TaskStatus::Running, at)
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use TaskStatus::*;

    #[rstest]
    #[case(Pending, Scheduled, true)]
    #[case(Pending, Running, true)]
    #[case(Scheduled, Scheduled, true)]
    #[case(Scheduled, Running, true)]
    #[case(Running, Running, true)]
    #[case(Running, Completed, true)]
    #[case(Running, Failed, true)]
    #[case(Pending, Failed, true)]
    #[case(Pending, Completed, false)]
    #[case(Running, Scheduled, false)]
    #[case(Running, Pending, false)]
    #[case(Scheduled, Pending, false)]
    fn transitions(#[case] from: TaskStatus, #[case] to: TaskStatus, #[case] allowed: bool) {
        assert_eq!(TaskStatus::can_transition(from, to), allowed);
    }

    #[test]
    fn terminal_states_have_no_exit() {
        for from in [Completed, Failed] {
            for to in TaskStatus::ALL {
                assert!(
                    !TaskStatus::can_transition(from, to),
                    "{from} -> {to} must be rejected"
                );
            }
        }
    }

    #[test]
    fn pending_is_never_written_by_update() {
        for from in TaskStatus::ALL {
            assert!(!TaskStatus::can_transition(from, Pending));
        }
    }

    #[test]
    fn status_string_roundtrip() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<TaskStatus>().is_err());
        assert_eq!(serde_json::to_string(&Running).unwrap(), "\"RUNNING\"");
    }
}
