//! The chunk/outcome model shared by the master and worker sides.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of work: a contiguous slice of the input dataset.
///
/// Chunks are opaque to the engine; only the user function knows their
/// internal structure. A chunk may be empty when the partitioner produced
/// more splits than there were items.
pub type Chunk = Vec<Value>;

/// The terminal outcome of one submitted task.
///
/// Failures are carried as values so that one failed chunk never aborts the
/// batch; callers inspect the slots of a finished run.
pub type TaskOutcome = Result<Value, TaskError>;

/// Classification of task and run failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// A precondition on caller-supplied arguments was violated.
    InvalidArgument,
    /// The user function could not be encoded for transport.
    Serialization,
    /// No worker was available to accept work.
    NoWorkersAvailable,
    /// The pool refused to accept a submission.
    Submission,
    /// The user function failed inside a worker, or the failure of the
    /// execution boundary itself was reified into the task's slot.
    WorkerExecution,
    /// The user function rejected the chunk shape; it most likely expects a
    /// single item instead of a collection of items.
    UserContractViolation,
    /// A wait deadline elapsed before the task resolved.
    Timeout,
    /// An engine invariant was violated.
    Internal,
}

impl TaskErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            TaskErrorKind::InvalidArgument => "invalid argument",
            TaskErrorKind::Serialization => "serialization",
            TaskErrorKind::NoWorkersAvailable => "no workers available",
            TaskErrorKind::Submission => "submission",
            TaskErrorKind::WorkerExecution => "worker execution",
            TaskErrorKind::UserContractViolation => "user contract violation",
            TaskErrorKind::Timeout => "timeout",
            TaskErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task failure as a serializable value.
///
/// `TaskError` crosses process and host boundaries unchanged, so it carries
/// no source chain; the originating failure is flattened into `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    /// Failure classification.
    pub kind: TaskErrorKind,
    /// Human-readable description of the failure.
    pub message: String,
}

impl TaskError {
    /// Builds an error of the given kind.
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A failure raised by (or around) the user function inside a worker.
    pub fn worker_execution(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::WorkerExecution, message)
    }

    /// A refused submission.
    pub fn submission(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Submission, message)
    }

    /// An elapsed wait deadline.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Timeout, message)
    }

    /// An engine invariant violation.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Internal, message)
    }
}
