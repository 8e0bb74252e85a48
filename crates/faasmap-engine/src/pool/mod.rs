//! The execution-backend seam.
//!
//! A [`WorkerPool`] exposes a set of named workers, each accepting one
//! asynchronous task at a time, and hands back a [`DeferredResult`] per
//! submission. The scheduler is the only driver and never submits a second
//! task to a worker whose previous task has not completed.

use std::time::Duration;

use tokio::sync::oneshot;

use faasmap_core::{Chunk, SerializedFunction, TaskError, TaskOutcome};

pub mod local;
pub mod remote;

/// Stable identifier of one remote execution slot.
pub type WorkerId = String;

/// Reasons a pool refuses a submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The pool has been shut down.
    #[error("pool is shut down")]
    PoolShutDown,
    /// The worker id is not part of this pool's active set.
    #[error("unknown worker `{0}`")]
    UnknownWorker(String),
    /// The worker's queue is full; its previous task has not completed.
    #[error("worker `{0}` cannot accept work right now")]
    WorkerBusy(String),
}

/// A pool of named workers that execute `(function, chunk)` tasks.
#[allow(async_fn_in_trait)]
pub trait WorkerPool: Send + Sync {
    /// Snapshot of the workers currently healthy and accepting work.
    ///
    /// May be empty. The order is arbitrary but stable within one call; the
    /// scheduler treats the set as fixed for the duration of one run.
    fn active_worker_ids(&self) -> Vec<WorkerId>;

    /// Number of active workers.
    fn worker_count(&self) -> usize {
        self.active_worker_ids().len()
    }

    /// Enqueues one task on the named worker without blocking.
    ///
    /// Fails with [`SubmitError::PoolShutDown`] once
    /// [`WorkerPool::shutdown`] has run.
    fn submit(
        &self,
        worker_id: &str,
        function: &SerializedFunction,
        chunk: Chunk,
    ) -> Result<DeferredResult, SubmitError>;

    /// Drains outstanding tasks and releases all resources. Idempotent.
    async fn shutdown(&self);
}

/// Single-shot handle over one submitted task.
///
/// Dropping the handle abandons the observation; it is best-effort
/// cancellation and need not abort the remote computation.
#[derive(Debug)]
pub struct DeferredResult {
    rx: oneshot::Receiver<TaskOutcome>,
}

impl DeferredResult {
    /// Wraps the receiving half of a task's reply channel.
    pub fn new(rx: oneshot::Receiver<TaskOutcome>) -> Self {
        Self { rx }
    }

    /// Creates a connected `(sender, handle)` pair for pool implementors.
    pub fn channel() -> (oneshot::Sender<TaskOutcome>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self::new(rx))
    }

    /// Waits for the task to resolve.
    ///
    /// With a deadline, an overdue wait yields a `Timeout` outcome — an
    /// observation of this caller only; the task may still complete later.
    /// A reply channel whose sender disappeared (the pool was torn down
    /// under a live task) yields an `Internal` outcome.
    pub async fn wait(self, timeout: Option<Duration>) -> TaskOutcome {
        match timeout {
            None => self
                .rx
                .await
                .unwrap_or_else(|_| Err(abandoned_task_error())),
            Some(limit) => match tokio::time::timeout(limit, self.rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(abandoned_task_error()),
                Err(_) => Err(TaskError::timeout(format!(
                    "task did not resolve within {limit:?}"
                ))),
            },
        }
    }
}

fn abandoned_task_error() -> TaskError {
    TaskError::internal("task abandoned: reply channel closed before an outcome was recorded")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use faasmap_core::TaskErrorKind;

    #[tokio::test]
    async fn wait_resolves_to_sent_outcome() {
        let (tx, deferred) = DeferredResult::channel();
        tx.send(Ok(json!(42))).unwrap();
        assert_eq!(deferred.wait(None).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn wait_with_deadline_times_out() {
        let (tx, deferred) = DeferredResult::channel();
        let err = deferred
            .wait(Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Timeout);
        drop(tx);
    }

    #[tokio::test]
    async fn dropped_sender_is_an_internal_error() {
        let (tx, deferred) = DeferredResult::channel();
        drop(tx);
        let err = deferred.wait(None).await.unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Internal);
    }
}
