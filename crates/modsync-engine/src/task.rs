//! Worker task identity and terminal status

use modsync_types::{Error, ErrorKind};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a worker task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new task ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal status of a worker task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task ran to completion
    Succeeded,
    /// The task observed cancellation and unwound
    Cancelled,
    /// The task ended with a fault of the given kind
    Faulted(ErrorKind),
}

impl TaskStatus {
    /// Classify a worker's result
    pub fn from_result(result: &Result<(), Error>) -> Self {
        match result {
            Ok(()) => Self::Succeeded,
            Err(error) if error.is_cancellation() => Self::Cancelled,
            Err(error) => Self::Faulted(error.kind()),
        }
    }

    /// Whether the task faulted
    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Faulted(kind) => write!(f, "faulted ({kind:?})"),
        }
    }
}

/// What became of one worker in a phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Task identifier
    pub id: TaskId,
    /// Index of the worker within its phase
    pub worker: usize,
    /// Terminal status
    pub status: TaskStatus,
    /// Wall time the worker ran for
    pub elapsed: Duration,
}
