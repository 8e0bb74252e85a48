//! The scheduler.
//!
//! `Master::run` couples a partitioner and a worker pool into one dispatch
//! loop: bootstrap one task per worker, then keep every worker busy by
//! issuing the next pending chunk to whichever worker completes first. The
//! result order is always partition order, whatever the completion order;
//! per-chunk failures land in their slot as values and never abort the
//! batch.

use futures::FutureExt as _;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use faasmap_core::codec::{self, CodecError, SerializedFunction};
use faasmap_core::{Chunk, FunctionRegistry, TaskError, TaskOutcome};

use crate::partition::{EvenSplit, PartitionError, Partitioner};
use crate::pool::{WorkerId, WorkerPool};

/// The ordered outcomes of one run, indexed by chunk index.
pub type RunResult = Vec<TaskOutcome>;

/// Failures that abort a run before any chunk is dispatched.
///
/// Everything that happens after dispatch starts is recorded per chunk in
/// the [`RunResult`] instead.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// A caller-supplied argument violated a precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The user function could not be encoded for transport.
    #[error("cannot serialize user function: {0}")]
    Serialization(#[from] CodecError),
    /// The pool reported no active workers.
    #[error("no workers available")]
    NoWorkersAvailable,
}

impl From<PartitionError> for RunError {
    fn from(err: PartitionError) -> Self {
        match err {
            PartitionError::InvalidArgument(message) => RunError::InvalidArgument(message),
        }
    }
}

/// Lifecycle state of one dispatched chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Submitted to a worker; no outcome yet.
    Submitted,
    /// Resolved with a value.
    Completed,
    /// Resolved with an error, or the submission itself was refused.
    Failed,
}

/// Observability record for one chunk of the most recent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Index of the chunk in partition order.
    pub chunk_index: usize,
    /// Worker the chunk was (last) assigned to.
    pub worker_id: Option<WorkerId>,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Failure description, when `state` is `Failed`.
    pub error: Option<String>,
}

type InflightTask = BoxFuture<'static, (usize, WorkerId, TaskOutcome)>;

/// Orchestrates parallel runs over a worker pool.
pub struct Master<P> {
    pool: P,
    registry: FunctionRegistry,
    partitioner: Box<dyn Partitioner>,
    statuses: Vec<TaskStatus>,
}

impl<P: WorkerPool> Master<P> {
    /// Creates a master over `pool` with the even-split partitioner.
    ///
    /// `registry` must contain every function later passed to
    /// [`Master::run`]; workers resolve the same names against their own
    /// registries.
    pub fn new(pool: P, registry: FunctionRegistry) -> Self {
        Self {
            pool,
            registry,
            partitioner: Box::new(EvenSplit),
            statuses: Vec::new(),
        }
    }

    /// Replaces the partitioning strategy.
    pub fn with_partitioner(mut self, partitioner: Box<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// The underlying pool.
    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Consumes the master and returns the pool, typically to shut it down.
    pub fn into_pool(self) -> P {
        self.pool
    }

    /// Runs `function` over `input`, one task per chunk.
    ///
    /// Returns one outcome per chunk, in partition order. Fatal conditions
    /// (nothing dispatched yet) surface as [`RunError`]; everything after
    /// dispatch starts is recorded per chunk.
    pub async fn run(&mut self, input: Vec<Value>, function: &str) -> Result<RunResult, RunError> {
        self.statuses.clear();

        let workers = self.pool.active_worker_ids();
        if workers.is_empty() {
            return Err(RunError::NoWorkersAvailable);
        }

        let blob = codec::encode(&self.registry, function)?;

        let chunks = self.partitioner.split(&input, workers.len())?;
        let total = chunks.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        debug!(chunks = total, workers = workers.len(), function, "starting run");

        let mut chunks: Vec<Option<Chunk>> = chunks.into_iter().map(Some).collect();
        let mut results: Vec<Option<TaskOutcome>> = (0..total).map(|_| None).collect();
        let mut inflight: FuturesUnordered<InflightTask> = FuturesUnordered::new();
        let mut next_index = 0usize;

        // Bootstrap: one task per worker, in pool-reported order.
        for worker in &workers {
            if next_index >= total {
                break;
            }
            self.dispatch_next(worker, &blob, &mut chunks, &mut results, &mut inflight, &mut next_index);
        }

        while let Some(first) = inflight.next().await {
            // Process every task that has already resolved before waiting
            // again, so simultaneous completions free their workers together.
            let mut completed = vec![first];
            while let Some(Some(more)) = inflight.next().now_or_never() {
                completed.push(more);
            }

            let mut freed = Vec::with_capacity(completed.len());
            for (index, worker, outcome) in completed {
                trace!(chunk_index = index, worker = %worker, ok = outcome.is_ok(), "task resolved");
                self.record_outcome(index, &outcome);
                results[index] = Some(outcome);
                freed.push(worker);
            }

            // Refill each freed worker, in completion-observation order.
            for worker in freed {
                if next_index >= total {
                    continue;
                }
                self.dispatch_next(&worker, &blob, &mut chunks, &mut results, &mut inflight, &mut next_index);
            }
        }

        let mut run_result = Vec::with_capacity(total);
        for (index, slot) in results.into_iter().enumerate() {
            match slot {
                Some(outcome) => run_result.push(outcome),
                None => {
                    // Should not occur: every chunk either resolved or was
                    // recorded as a submission failure.
                    let err = TaskError::internal(format!("no outcome recorded for chunk {index}"));
                    warn!(chunk_index = index, "filling unpopulated result slot");
                    self.record_failure(index, &err);
                    run_result.push(Err(err));
                }
            }
        }
        debug!(
            chunks = total,
            failed = run_result.iter().filter(|r| r.is_err()).count(),
            "run finished"
        );
        Ok(run_result)
    }

    /// Aggregates the successful outcomes of a run.
    ///
    /// Failed slots are filtered out first. With no successful outcome the
    /// aggregator is not called and `None` is returned; an error raised by
    /// the aggregator itself propagates to the caller.
    pub fn reduce<F>(&self, results: &[TaskOutcome], aggregator: F) -> anyhow::Result<Option<Value>>
    where
        F: FnOnce(Vec<Value>) -> anyhow::Result<Value>,
    {
        let successful: Vec<Value> = results
            .iter()
            .filter_map(|outcome| outcome.as_ref().ok().cloned())
            .collect();
        if successful.is_empty() {
            debug!("no successful outcomes to aggregate");
            return Ok(None);
        }
        Ok(Some(aggregator(successful)?))
    }

    /// Snapshot of the per-chunk statuses of the most recent run.
    pub fn task_statuses(&self) -> Vec<TaskStatus> {
        self.statuses.clone()
    }

    /// Submits the next pending chunk to `worker`.
    ///
    /// A refused submission marks its chunk failed and the worker stays
    /// idle for the chunk after it, so one broken submission never stalls
    /// the run.
    fn dispatch_next(
        &mut self,
        worker: &WorkerId,
        blob: &SerializedFunction,
        chunks: &mut [Option<Chunk>],
        results: &mut [Option<TaskOutcome>],
        inflight: &mut FuturesUnordered<InflightTask>,
        next_index: &mut usize,
    ) {
        while *next_index < chunks.len() {
            let index = *next_index;
            *next_index += 1;
            let chunk = chunks[index].take().unwrap_or_default();

            match self.pool.submit(worker, blob, chunk) {
                Ok(deferred) => {
                    trace!(chunk_index = index, worker = %worker, "chunk submitted");
                    self.statuses.push(TaskStatus {
                        chunk_index: index,
                        worker_id: Some(worker.clone()),
                        state: TaskState::Submitted,
                        error: None,
                    });
                    let worker = worker.clone();
                    inflight.push(
                        async move { (index, worker, deferred.wait(None).await) }.boxed(),
                    );
                    return;
                }
                Err(err) => {
                    warn!(chunk_index = index, worker = %worker, error = %err, "submission refused");
                    let task_err = TaskError::submission(format!(
                        "submit chunk {index} to worker `{worker}`: {err}"
                    ));
                    self.statuses.push(TaskStatus {
                        chunk_index: index,
                        worker_id: Some(worker.clone()),
                        state: TaskState::Failed,
                        error: Some(task_err.to_string()),
                    });
                    results[index] = Some(Err(task_err));
                }
            }
        }
    }

    fn record_outcome(&mut self, chunk_index: usize, outcome: &TaskOutcome) {
        match outcome {
            Ok(_) => self.set_status(chunk_index, TaskState::Completed, None),
            Err(err) => self.set_status(chunk_index, TaskState::Failed, Some(err.to_string())),
        }
    }

    fn record_failure(&mut self, chunk_index: usize, err: &TaskError) {
        self.set_status(chunk_index, TaskState::Failed, Some(err.to_string()));
    }

    fn set_status(&mut self, chunk_index: usize, state: TaskState, error: Option<String>) {
        match self
            .statuses
            .iter_mut()
            .find(|status| status.chunk_index == chunk_index)
        {
            Some(status) => {
                status.state = state;
                status.error = error;
            }
            None => self.statuses.push(TaskStatus {
                chunk_index,
                worker_id: None,
                state,
                error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::partition::FixedSize;
    use crate::pool::{DeferredResult, SubmitError};
    use faasmap_core::TaskErrorKind;

    /// Pool that resolves tasks by invoking the registered function inline.
    struct InlinePool {
        registry: FunctionRegistry,
        workers: Vec<WorkerId>,
        per_worker: Mutex<HashMap<WorkerId, usize>>,
        invocations: AtomicUsize,
        refuse_next: AtomicUsize,
    }

    impl InlinePool {
        fn new(registry: FunctionRegistry, num_workers: usize) -> Self {
            Self {
                registry,
                workers: (0..num_workers).map(|i| format!("w{i}")).collect(),
                per_worker: Mutex::new(HashMap::new()),
                invocations: AtomicUsize::new(0),
                refuse_next: AtomicUsize::new(0),
            }
        }

        fn refusing_next(self, count: usize) -> Self {
            self.refuse_next.store(count, Ordering::SeqCst);
            self
        }

        fn max_tasks_on_one_worker(&self) -> usize {
            self.per_worker
                .lock()
                .unwrap()
                .values()
                .copied()
                .max()
                .unwrap_or(0)
        }
    }

    impl WorkerPool for InlinePool {
        fn active_worker_ids(&self) -> Vec<WorkerId> {
            self.workers.clone()
        }

        fn submit(
            &self,
            worker_id: &str,
            function: &SerializedFunction,
            chunk: Chunk,
        ) -> Result<DeferredResult, SubmitError> {
            if !self.workers.iter().any(|id| id == worker_id) {
                return Err(SubmitError::UnknownWorker(worker_id.to_string()));
            }
            if self
                .refuse_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                return Err(SubmitError::WorkerBusy(worker_id.to_string()));
            }

            *self
                .per_worker
                .lock()
                .unwrap()
                .entry(worker_id.to_string())
                .or_default() += 1;
            self.invocations.fetch_add(1, Ordering::SeqCst);

            let prepared = codec::decode(&self.registry, function).expect("decodable function");
            let (tx, deferred) = DeferredResult::channel();
            let _ = tx.send(prepared.invoke(chunk));
            Ok(deferred)
        }

        async fn shutdown(&self) {}
    }

    fn test_registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register_typed("sum", |items: Vec<i64>| {
            Ok::<i64, String>(items.iter().sum())
        });
        registry.register_typed("square", |items: Vec<i64>| {
            Ok::<Vec<i64>, String>(items.iter().map(|x| x * x).collect())
        });
        registry.register_typed("fails_on_20", |items: Vec<i64>| {
            if items.contains(&20) {
                Err("cannot process 20".to_string())
            } else {
                Ok(items.iter().sum::<i64>())
            }
        });
        registry.register("echo", |chunk| Ok(Value::Array(chunk)));
        registry
    }

    fn numbers(range: std::ops::RangeInclusive<i64>) -> Vec<Value> {
        range.map(|n| json!(n)).collect()
    }

    fn sum_values(values: Vec<Value>) -> anyhow::Result<Value> {
        let mut total = 0;
        for value in values {
            total += value
                .as_i64()
                .ok_or_else(|| anyhow::anyhow!("not a number: {value}"))?;
        }
        Ok(json!(total))
    }

    fn flatten_values(values: Vec<Value>) -> anyhow::Result<Value> {
        let mut flat = Vec::new();
        for value in values {
            match value {
                Value::Array(items) => flat.extend(items),
                other => flat.push(other),
            }
        }
        Ok(Value::Array(flat))
    }

    #[tokio::test]
    async fn run_sums_chunks_in_partition_order() {
        let registry = test_registry();
        let mut master = Master::new(InlinePool::new(registry.clone(), 3), registry);

        let results = master.run(numbers(1..=7), "sum").await.unwrap();
        let values: Vec<&Value> = results.iter().map(|r| r.as_ref().unwrap()).collect();
        assert_eq!(values, vec![&json!(6), &json!(9), &json!(13)]);

        let total = master.reduce(&results, sum_values).unwrap();
        assert_eq!(total, Some(json!(28)));
    }

    #[tokio::test]
    async fn run_collects_nested_results_and_flattens() {
        let registry = test_registry();
        let mut master = Master::new(InlinePool::new(registry.clone(), 2), registry);

        let results = master.run(numbers(1..=5), "square").await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), &json!([1, 4, 9]));
        assert_eq!(results[1].as_ref().unwrap(), &json!([16, 25]));

        let flat = master.reduce(&results, flatten_values).unwrap();
        assert_eq!(flat, Some(json!([1, 4, 9, 16, 25])));
    }

    #[tokio::test]
    async fn empty_input_short_circuits() {
        let registry = test_registry();
        let mut master = Master::new(InlinePool::new(registry.clone(), 4), registry);

        let results = master.run(Vec::new(), "sum").await.unwrap();
        assert!(results.is_empty());
        assert!(master.task_statuses().is_empty());
        assert_eq!(master.reduce(&results, sum_values).unwrap(), None);
    }

    #[tokio::test]
    async fn chunk_failure_is_isolated_to_its_slot() {
        let registry = test_registry();
        let mut master = Master::new(InlinePool::new(registry.clone(), 2), registry);

        let input = vec![json!(10), json!(20), json!(30)];
        let results = master.run(input, "fails_on_20").await.unwrap();
        assert_eq!(results.len(), 2);

        // Even split puts [10, 20] in chunk 0 and [30] in chunk 1.
        let err = results[0].as_ref().unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::WorkerExecution);
        assert!(err.message.contains("cannot process 20"));
        assert_eq!(results[1].as_ref().unwrap(), &json!(30));

        let partial = master.reduce(&results, sum_values).unwrap();
        assert_eq!(partial, Some(json!(30)));

        let statuses = master.task_statuses();
        let failed = statuses.iter().find(|s| s.chunk_index == 0).unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert!(failed.error.as_ref().unwrap().contains("cannot process 20"));
        let completed = statuses.iter().find(|s| s.chunk_index == 1).unwrap();
        assert_eq!(completed.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn fixed_size_run_conserves_work() {
        let registry = test_registry();
        let pool = InlinePool::new(registry.clone(), 3);
        let mut master =
            Master::new(pool, registry).with_partitioner(Box::new(FixedSize::new(10).unwrap()));

        let results = master.run(numbers(1..=100), "sum").await.unwrap();
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(master.reduce(&results, sum_values).unwrap(), Some(json!(5050)));

        // 10 chunks over 3 workers: the user function ran once per chunk and
        // at least one worker took 4 of them.
        assert_eq!(master.pool().invocations.load(Ordering::SeqCst), 10);
        assert!(master.pool().max_tasks_on_one_worker() >= 4);
    }

    #[tokio::test]
    async fn no_workers_fails_fast() {
        let registry = test_registry();
        let mut master = Master::new(InlinePool::new(registry.clone(), 0), registry);
        let err = master.run(numbers(1..=3), "sum").await.unwrap_err();
        assert!(matches!(err, RunError::NoWorkersAvailable));
    }

    #[tokio::test]
    async fn unknown_function_fails_fast() {
        let registry = test_registry();
        let mut master = Master::new(InlinePool::new(registry.clone(), 2), registry);
        let err = master.run(numbers(1..=3), "no_such_fn").await.unwrap_err();
        assert!(matches!(err, RunError::Serialization(_)));
    }

    #[tokio::test]
    async fn refused_submission_marks_slot_and_run_continues() {
        let registry = test_registry();
        let pool = InlinePool::new(registry.clone(), 1).refusing_next(1);
        let mut master =
            Master::new(pool, registry).with_partitioner(Box::new(FixedSize::new(1).unwrap()));

        let results = master.run(numbers(1..=3), "sum").await.unwrap();
        assert_eq!(results.len(), 3);
        let err = results[0].as_ref().unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Submission);
        assert_eq!(results[1].as_ref().unwrap(), &json!(2));
        assert_eq!(results[2].as_ref().unwrap(), &json!(3));
    }

    #[tokio::test]
    async fn contract_violation_reaches_the_slot() {
        let registry = test_registry();
        let mut master = Master::new(InlinePool::new(registry.clone(), 2), registry);

        let input = vec![json!("a"), json!("b")];
        let results = master.run(input, "sum").await.unwrap();
        for outcome in &results {
            let err = outcome.as_ref().unwrap_err();
            assert_eq!(err.kind, TaskErrorKind::UserContractViolation);
        }
    }

    #[tokio::test]
    async fn echo_and_flatten_reconstruct_the_input() {
        let registry = test_registry();
        let mut master = Master::new(InlinePool::new(registry.clone(), 3), registry);

        let input = numbers(1..=17);
        let results = master.run(input.clone(), "echo").await.unwrap();
        let flat = master.reduce(&results, flatten_values).unwrap();
        assert_eq!(flat, Some(Value::Array(input)));
    }

    #[tokio::test]
    async fn aggregator_errors_propagate() {
        let registry = test_registry();
        let mut master = Master::new(InlinePool::new(registry.clone(), 2), registry);

        let results = master.run(numbers(1..=4), "sum").await.unwrap();
        let err = master
            .reduce(&results, |_| anyhow::bail!("aggregation exploded"))
            .unwrap_err();
        assert!(err.to_string().contains("aggregation exploded"));
    }

    #[tokio::test]
    async fn statuses_reset_between_runs() {
        let registry = test_registry();
        let mut master = Master::new(InlinePool::new(registry.clone(), 2), registry);

        master.run(numbers(1..=4), "sum").await.unwrap();
        assert_eq!(master.task_statuses().len(), 2);

        master.run(numbers(1..=6), "sum").await.unwrap();
        let statuses = master.task_statuses();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.state == TaskState::Completed));
    }
}
