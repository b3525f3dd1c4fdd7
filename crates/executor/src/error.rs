use store::{StoreError, TaskId};
use thiserror::Error;

/// Error kinds surfaced by the core, mirroring the error table: factory
/// lookup misses, shutdown races, abort policy violations, and the three
/// ways a subtask or task can end without a clean success.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no task type registered under tag {0:?}")]
    UnknownTaskType(String),

    #[error("executor is shutting down, refusing submission")]
    ExecutorShuttingDown,

    #[error("task type {0:?} is not abortable")]
    NotAbortable(String),

    #[error("no in-flight task with id {0}")]
    UnknownTask(TaskId),

    #[error("wait_for timed out before task {0} completed")]
    Timeout(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task {0} failed: {1}")]
    TaskFailed(TaskId, String),
}

/// The error a user `run` body (task or subtask) can return. Panics inside
/// user code are caught and converted to [`TaskError::Panic`]; everything
/// else is the user's own doing.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error("{0}")]
    Failure(String),

    #[error("subtask exceeded its time limit")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("panicked: {0}")]
    Panic(String),
}

impl TaskError {
    pub fn message(&self) -> String {
        self.to_string()
    }
}
