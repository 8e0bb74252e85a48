//! Local process-pool backend.
//!
//! Simulates a FaaS cluster on the local machine: every worker is an
//! isolated child process (user code may use process-wide state, so threads
//! are not enough). Children are re-executions of the current binary with
//! the spawn marker set; the host binary must call
//! [`faasmap_core::worker::maybe_become_worker`] before anything else.

use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use faasmap_core::wire::{InvokeReply, InvokeRequest};
use faasmap_core::worker::WORKER_ENV;
use faasmap_core::{Chunk, SerializedFunction, TaskError, TaskOutcome};

use super::{DeferredResult, SubmitError, WorkerId, WorkerPool};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for [`LocalPool`].
#[derive(Debug, Clone)]
pub struct LocalPoolConfig {
    /// Number of worker processes to spawn.
    pub num_workers: usize,
    /// Deadline for one task's round trip to a worker.
    ///
    /// An overdue task resolves to a `Timeout` outcome and the stale worker
    /// process is replaced (its pipe would otherwise be out of frame sync).
    /// `None` waits indefinitely.
    pub task_timeout: Option<Duration>,
}

/// Construction failures of the local pool.
#[derive(Debug, thiserror::Error)]
pub enum LocalPoolError {
    /// The configuration violated a precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A worker process could not be spawned.
    #[error("cannot spawn worker process: {0}")]
    Spawn(#[from] io::Error),
}

struct LocalJob {
    request: InvokeRequest,
    reply: oneshot::Sender<TaskOutcome>,
}

enum LocalCommand {
    Task(LocalJob),
    Stop,
}

/// A pool of isolated local worker processes.
pub struct LocalPool {
    worker_ids: Vec<WorkerId>,
    senders: Vec<mpsc::Sender<LocalCommand>>,
    executors: Mutex<JoinSet<()>>,
    shut_down: AtomicBool,
}

impl LocalPool {
    /// Spawns a pool of `num_workers` worker processes.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(num_workers: usize) -> Result<Self, LocalPoolError> {
        Self::spawn_with(LocalPoolConfig {
            num_workers,
            task_timeout: None,
        })
    }

    /// Spawns a pool from an explicit configuration.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_with(config: LocalPoolConfig) -> Result<Self, LocalPoolError> {
        if config.num_workers == 0 {
            return Err(LocalPoolError::InvalidArgument(
                "num_workers must be at least 1".to_string(),
            ));
        }

        let mut worker_ids = Vec::with_capacity(config.num_workers);
        let mut senders = Vec::with_capacity(config.num_workers);
        let mut executors = JoinSet::new();

        for index in 0..config.num_workers {
            let worker_id = format!("local-{index}");
            let child = WorkerChild::spawn()?;
            let (tx, rx) = mpsc::channel(1);
            senders.push(tx);
            executors.spawn(run_executor(
                worker_id.clone(),
                child,
                rx,
                config.task_timeout,
            ));
            worker_ids.push(worker_id);
        }

        debug!(workers = config.num_workers, "local pool started");
        Ok(Self {
            worker_ids,
            senders,
            executors: Mutex::new(executors),
            shut_down: AtomicBool::new(false),
        })
    }
}

impl WorkerPool for LocalPool {
    fn active_worker_ids(&self) -> Vec<WorkerId> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Vec::new();
        }
        self.worker_ids.clone()
    }

    fn submit(
        &self,
        worker_id: &str,
        function: &SerializedFunction,
        chunk: Chunk,
    ) -> Result<DeferredResult, SubmitError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SubmitError::PoolShutDown);
        }
        let index = self
            .worker_ids
            .iter()
            .position(|id| id == worker_id)
            .ok_or_else(|| SubmitError::UnknownWorker(worker_id.to_string()))?;

        let (tx, deferred) = DeferredResult::channel();
        let job = LocalJob {
            request: InvokeRequest::new(function, chunk),
            reply: tx,
        };
        match self.senders[index].try_send(LocalCommand::Task(job)) {
            Ok(()) => Ok(deferred),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(SubmitError::WorkerBusy(worker_id.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::PoolShutDown),
        }
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("shutting down local pool");
        for sender in &self.senders {
            let _ = sender.send(LocalCommand::Stop).await;
        }
        let mut executors = self.executors.lock().await;
        while executors.join_next().await.is_some() {}
    }
}

/// Owns one worker process for its lifetime; queued tasks are processed in
/// order, then the child is released.
async fn run_executor(
    worker_id: WorkerId,
    child: WorkerChild,
    mut rx: mpsc::Receiver<LocalCommand>,
    task_timeout: Option<Duration>,
) {
    let mut slot = Some(child);
    while let Some(command) = rx.recv().await {
        match command {
            LocalCommand::Stop => break,
            LocalCommand::Task(job) => {
                let outcome = run_task(&worker_id, &mut slot, &job.request, task_timeout).await;
                let _ = job.reply.send(outcome);
            }
        }
    }
    if let Some(child) = slot.take() {
        child.dispose().await;
    }
}

async fn run_task(
    worker_id: &str,
    slot: &mut Option<WorkerChild>,
    request: &InvokeRequest,
    task_timeout: Option<Duration>,
) -> TaskOutcome {
    let line = match serde_json::to_string(request) {
        Ok(line) => line,
        Err(err) => return Err(TaskError::internal(format!("encode request frame: {err}"))),
    };

    let child = match slot {
        Some(child) => child,
        None => match WorkerChild::spawn() {
            Ok(child) => slot.insert(child),
            Err(err) => {
                return Err(TaskError::worker_execution(format!(
                    "worker `{worker_id}` could not be respawned: {err}"
                )));
            }
        },
    };

    let reply = match task_timeout {
        None => Ok(child.exchange(&line).await),
        Some(limit) => match tokio::time::timeout(limit, child.exchange(&line)).await {
            Ok(reply) => Ok(reply),
            Err(_) => Err(limit),
        },
    };

    let reply = match reply {
        Ok(reply) => reply,
        Err(limit) => {
            warn!(worker = worker_id, "task overdue; replacing worker process");
            replace_child(worker_id, slot).await;
            return Err(TaskError::timeout(format!(
                "worker `{worker_id}` did not reply within {limit:?}"
            )));
        }
    };

    match reply {
        Ok(line) => match serde_json::from_str::<InvokeReply>(&line) {
            Ok(reply) => reply.into_outcome(),
            Err(err) => {
                warn!(worker = worker_id, error = %err, "unintelligible reply; replacing worker process");
                replace_child(worker_id, slot).await;
                Err(TaskError::worker_execution(format!(
                    "worker `{worker_id}` sent an unintelligible reply: {err}"
                )))
            }
        },
        Err(err) => {
            warn!(worker = worker_id, error = %err, "worker process failed; replacing it");
            replace_child(worker_id, slot).await;
            Err(TaskError::worker_execution(format!(
                "worker `{worker_id}` failed: {err}"
            )))
        }
    }
}

async fn replace_child(worker_id: &str, slot: &mut Option<WorkerChild>) {
    if let Some(child) = slot.take() {
        child.kill().await;
    }
    match WorkerChild::spawn() {
        Ok(child) => *slot = Some(child),
        Err(err) => {
            warn!(worker = worker_id, error = %err, "could not respawn worker process");
        }
    }
}

/// One spawned worker process with its protocol pipes.
///
/// Spawned with kill-on-drop so children never outlive the pool, whatever
/// the exit path.
struct WorkerChild {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerChild {
    fn spawn() -> io::Result<Self> {
        let program = std::env::current_exe()?;
        let mut child = Command::new(program)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout unavailable"))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// One request frame out, one reply frame back.
    async fn exchange(&mut self, line: &str) -> io::Result<String> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        let mut reply = String::new();
        let read = self.stdout.read_line(&mut reply).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "worker process closed its output",
            ));
        }
        Ok(reply)
    }

    /// Closes stdin and gives the worker a grace period to exit on its own.
    async fn dispose(mut self) {
        drop(self.stdin);
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => warn!(%status, "worker process exited abnormally"),
            Ok(Err(err)) => warn!(error = %err, "waiting for worker process failed"),
            Err(_) => {
                warn!("worker process ignored shutdown; killing it");
                if let Err(err) = self.child.kill().await {
                    warn!(error = %err, "killing worker process failed");
                }
            }
        }
    }

    async fn kill(mut self) {
        if let Err(err) = self.child.kill().await {
            warn!(error = %err, "killing worker process failed");
        }
    }
}
