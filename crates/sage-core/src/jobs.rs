//! Background job dispatch, lifecycle tracking and retry
//!
//! The orchestrator treats the queue as a capability: enqueue a
//! descriptor, poll a status. The in-process implementation runs a pool
//! of worker tasks that call the inference backend with bounded retry
//! and hand terminal outcomes to the [`ResultMaterializer`]. Retries are
//! internal to a job: one record per dispatch, `attempt_count` mutated
//! in place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::InferenceBackend;
use crate::config::{QueueConfig, RetryPolicy};
use crate::fingerprint::Fingerprint;
use crate::materializer::ResultMaterializer;
use crate::prediction::PredictionRequest;
use crate::{CoreError, Result};

/// Work item handed to the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Job identity, assigned by the dispatcher before enqueue so the
    /// in-flight marker can carry it
    pub job_id: Uuid,

    /// Fingerprint the job computes
    pub fingerprint: Fingerprint,

    /// The request to run
    pub request: PredictionRequest,
}

impl JobDescriptor {
    pub fn new(fingerprint: Fingerprint, request: PredictionRequest) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            fingerprint,
            request,
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Whether the job has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Tracked state of a dispatched job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub fingerprint: Fingerprint,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub result: Option<Value>,
    pub failure_reason: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl JobRecord {
    fn new(descriptor: &JobDescriptor) -> Self {
        Self {
            job_id: descriptor.job_id,
            fingerprint: descriptor.fingerprint.clone(),
            status: JobStatus::Queued,
            attempt_count: 0,
            result: None,
            failure_reason: None,
            enqueued_at: Utc::now(),
        }
    }
}

/// Durable background execution capability.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Accept a job for execution. Fails with `QueueUnavailable` when the
    /// broker cannot take work.
    async fn enqueue(&self, descriptor: JobDescriptor) -> Result<Uuid>;

    /// Current status of a job, `None` for unknown job ids
    async fn status(&self, job_id: Uuid) -> Result<Option<JobStatus>>;
}

/// Backoff delay before the attempt after `attempt` failures.
///
/// Pure function of the attempt number and policy so the schedule is
/// testable without timers: base * 2^(attempt-1), capped, with optional
/// jitter in [cap/2, cap].
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let raw = policy.base_delay_ms.saturating_mul(1u64 << exponent);
    let capped = raw.min(policy.max_delay_ms);
    let millis = if policy.jitter && capped > 1 {
        let half = capped / 2;
        half + rand::thread_rng().gen_range(0..=capped - half)
    } else {
        capped
    };
    Duration::from_millis(millis)
}

/// In-process [`JobQueue`] running jobs on a pool of async worker tasks.
pub struct InMemoryJobQueue {
    sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<JobDescriptor>>>,
    records: Arc<DashMap<Uuid, JobRecord>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl InMemoryJobQueue {
    /// Spawn the worker pool and return the queue handle.
    ///
    /// Workers share one receiver; each picks up the next descriptor as
    /// it frees up, runs the inference attempt loop, and reports the
    /// terminal outcome through the materializer.
    pub fn start(
        backend: Arc<dyn InferenceBackend>,
        materializer: Arc<ResultMaterializer>,
        config: &QueueConfig,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let records: Arc<DashMap<Uuid, JobRecord>> = Arc::new(DashMap::new());
        let attempt_timeout = Duration::from_millis(config.attempt_timeout_ms);

        let mut handles = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let receiver = Arc::clone(&receiver);
            let backend = Arc::clone(&backend);
            let materializer = Arc::clone(&materializer);
            let records = Arc::clone(&records);
            let retry = retry.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(
                    worker_id,
                    receiver,
                    backend,
                    materializer,
                    records,
                    retry,
                    attempt_timeout,
                )
                .await;
            }));
        }
        info!(workers = config.workers, "prediction worker pool started");

        Arc::new(Self {
            sender: parking_lot::Mutex::new(Some(sender)),
            records,
            workers: tokio::sync::Mutex::new(handles),
        })
    }

    /// Full record for a job, if known
    pub fn job(&self, job_id: Uuid) -> Option<JobRecord> {
        self.records.get(&job_id).map(|record| record.value().clone())
    }

    /// Stop accepting work and wait for in-flight jobs to finish
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for outcome in futures::future::join_all(handles).await {
            if let Err(err) = outcome {
                warn!(error = %err, "worker task ended abnormally");
            }
        }
        info!("prediction worker pool drained");
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, descriptor: JobDescriptor) -> Result<Uuid> {
        let job_id = descriptor.job_id;
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            return Err(CoreError::QueueUnavailable {
                message: "queue is shut down".to_string(),
            });
        };

        self.records.insert(job_id, JobRecord::new(&descriptor));
        if sender.send(descriptor).is_err() {
            self.records.remove(&job_id);
            return Err(CoreError::QueueUnavailable {
                message: "worker pool is no longer running".to_string(),
            });
        }
        debug!(job_id = %job_id, "job enqueued");
        Ok(job_id)
    }

    async fn status(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        Ok(self.records.get(&job_id).map(|record| record.status))
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<JobDescriptor>>>,
    backend: Arc<dyn InferenceBackend>,
    materializer: Arc<ResultMaterializer>,
    records: Arc<DashMap<Uuid, JobRecord>>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
) {
    debug!(worker_id, "prediction worker online");
    loop {
        let descriptor = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(descriptor) = descriptor else {
            break;
        };
        execute_job(
            descriptor,
            &backend,
            &materializer,
            &records,
            &retry,
            attempt_timeout,
        )
        .await;
    }
    debug!(worker_id, "prediction worker stopped");
}

async fn execute_job(
    descriptor: JobDescriptor,
    backend: &Arc<dyn InferenceBackend>,
    materializer: &Arc<ResultMaterializer>,
    records: &Arc<DashMap<Uuid, JobRecord>>,
    retry: &RetryPolicy,
    attempt_timeout: Duration,
) {
    let JobDescriptor {
        job_id,
        fingerprint,
        request,
    } = descriptor;

    if let Some(mut record) = records.get_mut(&job_id) {
        record.status = JobStatus::Running;
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if let Some(mut record) = records.get_mut(&job_id) {
            record.attempt_count = attempt;
        }

        let outcome = tokio::time::timeout(
            attempt_timeout,
            backend.infer(
                &request.model_name,
                request.resolved_version(),
                &request.input_features,
            ),
        )
        .await;

        let error = match outcome {
            Ok(Ok(inference)) => {
                let value = inference.value.clone();
                match materializer
                    .record_success(&fingerprint, &request.model_name, inference)
                    .await
                {
                    Ok(_) => {
                        if let Some(mut record) = records.get_mut(&job_id) {
                            record.status = JobStatus::Succeeded;
                            record.result = Some(value);
                        }
                        info!(
                            job_id = %job_id,
                            fingerprint = %fingerprint,
                            attempt,
                            "job succeeded"
                        );
                        return;
                    }
                    Err(err) => err,
                }
            }
            Ok(Err(err)) => err,
            Err(_) => CoreError::InferenceTimeout {
                model: request.model_name.clone(),
                timeout_ms: attempt_timeout.as_millis() as u64,
            },
        };

        if error.is_retryable() && attempt < retry.max_attempts {
            let delay = backoff_delay(attempt, retry);
            warn!(
                job_id = %job_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "inference attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        materializer
            .record_failure(&fingerprint, &error.to_string())
            .await;
        if let Some(mut record) = records.get_mut(&job_id) {
            record.status = JobStatus::Failed;
            record.failure_reason = Some(error.to_string());
        }
        warn!(
            job_id = %job_id,
            fingerprint = %fingerprint,
            attempts = attempt,
            error = %error,
            "job failed terminally"
        );
        return;
    }
}
