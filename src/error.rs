//! Error types of the queue, the pool and the tasks running on it.
//!
//! Contention is not an error: blocking calls just wait.
//! Deadlock isn't one either - nothing can detect it at runtime, see [crate::deadlock].

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue capacity must be greater than zero")]
    ZeroCapacity,

    #[error("queue is closed")]
    Closed,

    #[error("wait on the queue was cancelled")]
    Cancelled,

    #[error("queue is full")]
    Full,

    #[error("queue is empty")]
    Empty,

    #[error("timed out waiting on the queue")]
    TimedOut,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("a pool needs at least one worker")]
    ZeroWorkers,

    #[error("invalid task queue: {0}")]
    Queue(QueueError),

    /// Submission after `shutdown` or `shutdown_now`.
    #[error("pool is shut down, task rejected")]
    Rejected,

    #[error("task queue is full")]
    QueueFull,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// How a task may end other than with its value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error("timed out waiting for the task")]
    TimedOut,
}

impl TaskError {
    /// Shorthand for tasks returning their own errors.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}
