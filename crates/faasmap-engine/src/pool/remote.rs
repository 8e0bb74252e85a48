//! Remote FaaS pool backend.
//!
//! One long-lived executor per configured endpoint, addressed through the
//! provider's central service: `{service}/endpoints/{id}/...`. Endpoints
//! whose externally-reported status is not online at initialization are left
//! out of the active set. Interactive configuration (login, endpoint
//! selection, persisting the endpoints file) lives in external tooling; this
//! pool only needs endpoint ids.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use faasmap_core::wire::{InvokeReply, InvokeRequest};
use faasmap_core::{Chunk, SerializedFunction, TaskError, TaskOutcome};

use super::{DeferredResult, SubmitError, WorkerId, WorkerPool};
use crate::endpoints::EndpointsConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const STATUS_ONLINE: &str = "online";

struct RemoteJob {
    request: InvokeRequest,
    reply: oneshot::Sender<TaskOutcome>,
}

enum RemoteCommand {
    Task(RemoteJob),
    Stop,
}

/// A pool of remote FaaS endpoints.
pub struct RemoteFaasPool {
    worker_ids: Vec<WorkerId>,
    senders: Vec<mpsc::Sender<RemoteCommand>>,
    executors: Mutex<JoinSet<()>>,
    shut_down: AtomicBool,
}

impl RemoteFaasPool {
    /// Probes the configured endpoints and starts one executor per endpoint
    /// that reports itself online.
    ///
    /// Endpoints that are offline or unreachable are skipped with a warning;
    /// an all-offline configuration yields a pool with no active workers.
    /// Fails only when the HTTP client cannot be built.
    pub async fn connect(
        service_url: Url,
        config: &EndpointsConfig,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let mut worker_ids = Vec::new();
        let mut senders = Vec::new();
        let mut executors = JoinSet::new();

        for endpoint_id in config.endpoint_ids() {
            match fetch_endpoint_status(&http, &service_url, &endpoint_id).await {
                Ok(status) if status == STATUS_ONLINE => {}
                Ok(status) => {
                    warn!(endpoint = %endpoint_id, %status, "endpoint is not online; skipping it");
                    continue;
                }
                Err(err) => {
                    warn!(endpoint = %endpoint_id, "cannot probe endpoint; skipping it: {err:#}");
                    continue;
                }
            }

            let (tx, rx) = mpsc::channel(1);
            executors.spawn(run_executor(
                endpoint_id.clone(),
                http.clone(),
                service_url.clone(),
                rx,
            ));
            senders.push(tx);
            worker_ids.push(endpoint_id);
        }

        if worker_ids.is_empty() {
            warn!("no usable endpoints; the pool has no active workers");
        } else {
            debug!(endpoints = worker_ids.len(), "remote pool started");
        }

        Ok(Self {
            worker_ids,
            senders,
            executors: Mutex::new(executors),
            shut_down: AtomicBool::new(false),
        })
    }
}

impl WorkerPool for RemoteFaasPool {
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
        let job = RemoteJob {
            request: InvokeRequest::new(function, chunk),
            reply: tx,
        };
        match self.senders[index].try_send(RemoteCommand::Task(job)) {
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
        debug!("shutting down remote pool");
        for sender in &self.senders {
            let _ = sender.send(RemoteCommand::Stop).await;
        }
        let mut executors = self.executors.lock().await;
        while executors.join_next().await.is_some() {}
    }
}

async fn run_executor(
    endpoint_id: WorkerId,
    http: reqwest::Client,
    service_url: Url,
    mut rx: mpsc::Receiver<RemoteCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            RemoteCommand::Stop => break,
            RemoteCommand::Task(job) => {
                let outcome =
                    invoke_endpoint(&http, &service_url, &endpoint_id, &job.request).await;
                let _ = job.reply.send(outcome);
            }
        }
    }
}

/// Every transport failure is reified into the task's slot: a request
/// deadline becomes `Timeout`, anything else `WorkerExecution`.
async fn invoke_endpoint(
    http: &reqwest::Client,
    service_url: &Url,
    endpoint_id: &str,
    request: &InvokeRequest,
) -> TaskOutcome {
    match post_invocation(http, service_url, endpoint_id, request).await {
        Ok(reply) => reply.into_outcome(),
        Err(err) if is_timeout(&err) => Err(TaskError::timeout(format!(
            "endpoint `{endpoint_id}` did not reply in time: {err:#}"
        ))),
        Err(err) => Err(TaskError::worker_execution(format!(
            "endpoint `{endpoint_id}` request failed: {err:#}"
        ))),
    }
}

async fn post_invocation(
    http: &reqwest::Client,
    service_url: &Url,
    endpoint_id: &str,
    request: &InvokeRequest,
) -> anyhow::Result<InvokeReply> {
    let url = service_url.join(&format!("endpoints/{endpoint_id}/invoke"))?;
    let res = http.post(url).json(request).send().await?;
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        anyhow::bail!("http {status}: {body}");
    }
    Ok(res.json().await?)
}

#[derive(Debug, Deserialize)]
struct EndpointStatusBody {
    status: String,
}

async fn fetch_endpoint_status(
    http: &reqwest::Client,
    service_url: &Url,
    endpoint_id: &str,
) -> anyhow::Result<String> {
    let url = service_url.join(&format!("endpoints/{endpoint_id}/status"))?;
    let res = http.get(url).send().await?;
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        anyhow::bail!("http {status}: {body}");
    }
    let body: EndpointStatusBody = res.json().await?;
    Ok(body.status)
}

fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .is_some_and(reqwest::Error::is_timeout)
    })
}

/// Externally-reported health of one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointHealth {
    /// Endpoint identifier.
    pub id: String,
    /// Reported status, or `unreachable: …` when the probe failed.
    pub status: String,
}

/// Probes each endpoint and reports its status.
///
/// This is the non-interactive core of endpoint enumeration; display and
/// selection belong to external tooling.
pub async fn list_endpoint_statuses(
    service_url: &Url,
    endpoint_ids: &[String],
) -> Result<Vec<EndpointHealth>, reqwest::Error> {
    let http = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?;

    let mut health = Vec::with_capacity(endpoint_ids.len());
    for endpoint_id in endpoint_ids {
        let status = match fetch_endpoint_status(&http, service_url, endpoint_id).await {
            Ok(status) => status,
            Err(err) => format!("unreachable: {err:#}"),
        };
        health.push(EndpointHealth {
            id: endpoint_id.clone(),
            status,
        });
    }
    Ok(health)
}
