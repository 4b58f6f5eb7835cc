//! Integration tests for the prediction pipeline
//!
//! These exercise the orchestrator against the in-memory cache store and
//! the in-process worker pool, with scripted inference backends standing
//! in for real model serving.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use sage_core::backend::{Inference, InferenceBackend};
use sage_core::cache::{CacheStore, InMemoryCacheStore};
use sage_core::config::{
    ExecutionMode, FollowerMode, ModelProfile, OrchestratorConfig, RetryPolicy,
};
use sage_core::fingerprint::fingerprint;
use sage_core::inflight::{FlightBoard, InFlightMarker};
use sage_core::jobs::{InMemoryJobQueue, JobDescriptor, JobQueue, JobStatus};
use sage_core::materializer::ResultMaterializer;
use sage_core::orchestrator::PredictionOrchestrator;
use sage_core::prediction::{PredictionOutcome, PredictionRequest, PredictionSource};
use sage_core::{CoreError, Result};

/// Backend with scripted behavior: optional latency, a number of leading
/// failures, then a fixed value.
struct ScriptedBackend {
    calls: AtomicUsize,
    delay: Duration,
    failures_before_success: usize,
    always_fail: bool,
    value: Value,
}

impl ScriptedBackend {
    fn returning(value: Value) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            failures_before_success: 0,
            always_fail: false,
            value,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing_first(mut self, failures: usize) -> Self {
        self.failures_before_success = failures;
        self
    }

    fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn infer(
        &self,
        model_name: &str,
        model_version: &str,
        _features: &BTreeMap<String, Value>,
    ) -> Result<Inference> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.always_fail || call <= self.failures_before_success {
            return Err(CoreError::ModelUnavailable {
                model: model_name.to_string(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(Inference {
            value: self.value.clone(),
            version_used: if model_version == "latest" {
                "v1".to_string()
            } else {
                model_version.to_string()
            },
        })
    }
}

/// Job queue stub whose broker is down.
struct UnavailableQueue;

#[async_trait]
impl JobQueue for UnavailableQueue {
    async fn enqueue(&self, _descriptor: JobDescriptor) -> Result<Uuid> {
        Err(CoreError::QueueUnavailable {
            message: "broker connection refused".to_string(),
        })
    }

    async fn status(&self, _job_id: Uuid) -> Result<Option<JobStatus>> {
        Err(CoreError::QueueUnavailable {
            message: "broker connection refused".to_string(),
        })
    }
}

/// Cache store stub whose store is unreachable.
struct BrokenCacheStore;

#[async_trait]
impl CacheStore for BrokenCacheStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(CoreError::CacheUnavailable {
            message: "store unreachable".to_string(),
        })
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
        Err(CoreError::CacheUnavailable {
            message: "store unreachable".to_string(),
        })
    }

    async fn set_if_absent(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Option<Duration>,
    ) -> Result<bool> {
        Err(CoreError::CacheUnavailable {
            message: "store unreachable".to_string(),
        })
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(CoreError::CacheUnavailable {
            message: "store unreachable".to_string(),
        })
    }
}

struct TestPipeline {
    orchestrator: Arc<PredictionOrchestrator>,
    cache: Arc<InMemoryCacheStore>,
    queue: Arc<InMemoryJobQueue>,
}

/// Opt-in pipeline logging for debugging test failures:
/// `RUST_LOG=sage_core=debug cargo test`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 4,
        jitter: false,
    }
}

fn build(mut config: OrchestratorConfig, backend: Arc<dyn InferenceBackend>) -> TestPipeline {
    init_tracing();
    config.retry = fast_retry();
    config.queue.workers = 2;
    let config = Arc::new(config);

    let cache = Arc::new(InMemoryCacheStore::new());
    let flights = Arc::new(FlightBoard::new());
    let materializer = Arc::new(ResultMaterializer::new(
        cache.clone() as Arc<dyn CacheStore>,
        flights.clone(),
        config.clone(),
    ));
    let queue = InMemoryJobQueue::start(
        backend.clone(),
        materializer.clone(),
        &config.queue,
        config.retry.clone(),
    );
    let orchestrator = Arc::new(PredictionOrchestrator::new(
        config,
        cache.clone() as Arc<dyn CacheStore>,
        queue.clone() as Arc<dyn JobQueue>,
        backend,
        flights,
        materializer,
    ));

    TestPipeline {
        orchestrator,
        cache,
        queue,
    }
}

fn deferred_config(model_name: &str) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.models.insert(
        model_name.to_string(),
        ModelProfile {
            execution: ExecutionMode::Deferred,
            ttl_secs: None,
            inline_timeout_ms: None,
        },
    );
    config
}

fn dropout_request() -> PredictionRequest {
    PredictionRequest::new("student-42", "course-9", "dropout_risk")
        .with_version("v2")
        .with_feature("attendance", json!(0.4))
        .with_feature("gpa", json!(2.1))
}

async fn wait_for_terminal(queue: &InMemoryJobQueue, job_id: Uuid) -> JobStatus {
    for _ in 0..500 {
        if let Some(status) = queue.status(job_id).await.unwrap() {
            if status.is_terminal() {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} did not reach a terminal state in time", job_id);
}

fn pending_job_id(outcome: &PredictionOutcome) -> Uuid {
    match outcome {
        PredictionOutcome::Pending { job_id: Some(id) } => *id,
        other => panic!("expected a pending job, got {:?}", other),
    }
}

#[tokio::test]
async fn cache_hit_skips_the_backend() {
    let backend = Arc::new(ScriptedBackend::returning(json!(0.73)));
    let pipeline = build(OrchestratorConfig::default(), backend.clone());
    let request = dropout_request();

    let first = pipeline.orchestrator.get_or_compute(&request).await.unwrap();
    let prediction = first.prediction().expect("inline result");
    assert_eq!(prediction.value, json!(0.73));
    assert_eq!(prediction.source, PredictionSource::Computed);
    assert_eq!(prediction.model_version, "v2");

    let second = pipeline.orchestrator.get_or_compute(&request).await.unwrap();
    let prediction = second.prediction().expect("cached result");
    assert_eq!(prediction.value, json!(0.73));
    assert_eq!(prediction.source, PredictionSource::Cache);

    assert_eq!(backend.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_invoke_the_backend_once() {
    const CALLERS: usize = 16;

    let backend = Arc::new(
        ScriptedBackend::returning(json!(0.42)).with_delay(Duration::from_millis(50)),
    );
    let mut config = OrchestratorConfig::default();
    config.follower.mode = FollowerMode::Block;
    let pipeline = build(config, backend.clone());

    let barrier = Arc::new(tokio::sync::Barrier::new(CALLERS));
    let mut handles = Vec::new();
    for _ in 0..CALLERS {
        let orchestrator = Arc::clone(&pipeline.orchestrator);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            let request = dropout_request();
            barrier.wait().await;
            orchestrator.get_or_compute(&request).await
        }));
    }

    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        let prediction = outcome.prediction().expect("every caller sees the result");
        assert_eq!(prediction.value, json!(0.42));
    }
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn deferred_request_runs_in_background_and_caches() {
    let backend = Arc::new(ScriptedBackend::returning(json!(0.73)));
    let pipeline = build(deferred_config("dropout_risk"), backend.clone());
    let request = dropout_request();

    let outcome = pipeline.orchestrator.get_or_compute(&request).await.unwrap();
    let job_id = pending_job_id(&outcome);

    assert_eq!(
        wait_for_terminal(&pipeline.queue, job_id).await,
        JobStatus::Succeeded
    );
    let record = pipeline.queue.job(job_id).expect("job record");
    assert_eq!(record.result, Some(json!(0.73)));
    assert_eq!(record.attempt_count, 1);

    let cached = pipeline.orchestrator.get_or_compute(&request).await.unwrap();
    let prediction = cached.prediction().expect("cached result");
    assert_eq!(prediction.value, json!(0.73));
    assert_eq!(prediction.source, PredictionSource::Cache);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let backend = Arc::new(ScriptedBackend::returning(json!(0.9)).failing_first(2));
    let pipeline = build(deferred_config("learning_path"), backend.clone());
    let request = PredictionRequest::new("student-7", "course-3", "learning_path")
        .with_feature("completed_units", json!(14));

    let outcome = pipeline.orchestrator.get_or_compute(&request).await.unwrap();
    let job_id = pending_job_id(&outcome);

    assert_eq!(
        wait_for_terminal(&pipeline.queue, job_id).await,
        JobStatus::Succeeded
    );
    let record = pipeline.queue.job(job_id).expect("job record");
    assert_eq!(record.attempt_count, 3);
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn exhausted_retries_fail_the_job_and_allow_a_fresh_attempt() {
    let backend = Arc::new(ScriptedBackend::returning(json!(0.0)).always_failing());
    let pipeline = build(deferred_config("dropout_risk"), backend.clone());
    let request = dropout_request();
    let fp = fingerprint(&request);

    let outcome = pipeline.orchestrator.get_or_compute(&request).await.unwrap();
    let first_job = pending_job_id(&outcome);

    assert_eq!(
        wait_for_terminal(&pipeline.queue, first_job).await,
        JobStatus::Failed
    );
    let record = pipeline.queue.job(first_job).expect("job record");
    assert_eq!(record.attempt_count, 3);
    assert!(record.failure_reason.is_some());
    assert_eq!(backend.calls(), 3);

    // No cache pollution, no lingering marker
    assert!(pipeline.cache.get(&fp.entry_key()).await.unwrap().is_none());
    assert!(pipeline.cache.get(&fp.marker_key()).await.unwrap().is_none());

    // The next request starts a fresh job rather than replaying the failure
    let retried = pipeline.orchestrator.get_or_compute(&request).await.unwrap();
    let second_job = pending_job_id(&retried);
    assert_ne!(first_job, second_job);

    assert_eq!(
        wait_for_terminal(&pipeline.queue, second_job).await,
        JobStatus::Failed
    );
    assert_eq!(backend.calls(), 6);
}

#[tokio::test]
async fn orphaned_marker_is_reclaimed_by_the_next_caller() {
    let backend = Arc::new(ScriptedBackend::returning(json!(0.55)));
    let pipeline = build(OrchestratorConfig::default(), backend.clone());
    let request = dropout_request();
    let fp = fingerprint(&request);

    // Simulate a worker that crashed without reporting completion
    let mut orphan = InFlightMarker::new(&fp, Some(Uuid::new_v4()));
    orphan.created_at = chrono::Utc::now() - chrono::Duration::seconds(600);
    pipeline
        .cache
        .set(&fp.marker_key(), &orphan.encode().unwrap(), None)
        .await
        .unwrap();

    let outcome = pipeline.orchestrator.get_or_compute(&request).await.unwrap();
    let prediction = outcome.prediction().expect("reclaimed and computed");
    assert_eq!(prediction.value, json!(0.55));
    assert_eq!(backend.calls(), 1);
    assert!(pipeline.cache.get(&fp.marker_key()).await.unwrap().is_none());
}

#[tokio::test]
async fn live_marker_makes_poll_mode_followers_pend() {
    let backend = Arc::new(
        ScriptedBackend::returning(json!(0.61)).with_delay(Duration::from_millis(150)),
    );
    let pipeline = build(OrchestratorConfig::default(), backend.clone());

    let leader = {
        let orchestrator = Arc::clone(&pipeline.orchestrator);
        tokio::spawn(async move { orchestrator.get_or_compute(&dropout_request()).await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;

    let follower = pipeline
        .orchestrator
        .get_or_compute(&dropout_request())
        .await
        .unwrap();
    // Inline flights carry no job id; the follower just polls again later
    assert_eq!(follower, PredictionOutcome::Pending { job_id: None });

    let leader_outcome = leader.await.unwrap().unwrap();
    assert_eq!(
        leader_outcome.prediction().expect("leader result").value,
        json!(0.61)
    );
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn blocking_followers_see_the_leader_failure() {
    let backend = Arc::new(
        ScriptedBackend::returning(json!(0.0))
            .always_failing()
            .with_delay(Duration::from_millis(120)),
    );
    let mut config = OrchestratorConfig::default();
    config.follower.mode = FollowerMode::Block;
    let pipeline = build(config, backend.clone());

    let leader = {
        let orchestrator = Arc::clone(&pipeline.orchestrator);
        tokio::spawn(async move { orchestrator.get_or_compute(&dropout_request()).await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;

    let follower = pipeline.orchestrator.get_or_compute(&dropout_request()).await;
    assert!(matches!(
        follower,
        Err(CoreError::ComputationFailed { .. })
    ));

    assert!(matches!(
        leader.await.unwrap(),
        Err(CoreError::ModelUnavailable { .. })
    ));
    // Inline leaders do not retry
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn queue_outage_fails_the_request_and_releases_the_marker() {
    let backend = Arc::new(ScriptedBackend::returning(json!(0.5)));
    let config = Arc::new(deferred_config("dropout_risk"));
    let cache = Arc::new(InMemoryCacheStore::new());
    let flights = Arc::new(FlightBoard::new());
    let materializer = Arc::new(ResultMaterializer::new(
        cache.clone() as Arc<dyn CacheStore>,
        flights.clone(),
        config.clone(),
    ));
    let orchestrator = PredictionOrchestrator::new(
        config,
        cache.clone() as Arc<dyn CacheStore>,
        Arc::new(UnavailableQueue) as Arc<dyn JobQueue>,
        backend.clone(),
        flights,
        materializer,
    );

    let request = dropout_request();
    let fp = fingerprint(&request);
    let outcome = orchestrator.get_or_compute(&request).await;
    assert!(matches!(outcome, Err(CoreError::QueueUnavailable { .. })));

    // A later request must not find a wedged marker
    assert!(cache.get(&fp.marker_key()).await.unwrap().is_none());
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn invalid_requests_never_reach_the_pipeline() {
    let backend = Arc::new(ScriptedBackend::returning(json!(0.5)));
    let pipeline = build(OrchestratorConfig::default(), backend.clone());

    // No features at all
    let request = PredictionRequest::new("student-1", "course-1", "dropout_risk");
    let outcome = pipeline.orchestrator.get_or_compute(&request).await;
    assert!(matches!(outcome, Err(CoreError::InvalidInput { .. })));

    assert_eq!(backend.calls(), 0);
    assert!(pipeline.cache.is_empty());
}

#[tokio::test]
async fn cache_outage_degrades_inline_and_fails_deferred() {
    let backend = Arc::new(ScriptedBackend::returning(json!(0.8)));
    let mut config = deferred_config("learning_path");
    config.retry = fast_retry();
    let config = Arc::new(config);
    let cache = Arc::new(BrokenCacheStore) as Arc<dyn CacheStore>;
    let flights = Arc::new(FlightBoard::new());
    let materializer = Arc::new(ResultMaterializer::new(
        cache.clone(),
        flights.clone(),
        config.clone(),
    ));
    let queue = InMemoryJobQueue::start(
        backend.clone(),
        materializer.clone(),
        &config.queue,
        config.retry.clone(),
    );
    let orchestrator = PredictionOrchestrator::new(
        config,
        cache,
        queue.clone() as Arc<dyn JobQueue>,
        backend.clone(),
        flights,
        materializer,
    );

    // Inline model class: compute without the cache
    let inline_request = dropout_request();
    let outcome = orchestrator.get_or_compute(&inline_request).await.unwrap();
    let prediction = outcome.prediction().expect("degraded inline result");
    assert_eq!(prediction.value, json!(0.8));
    assert_eq!(prediction.source, PredictionSource::Computed);

    // Deferred model class: nothing sane to do without the shared store
    let deferred_request = PredictionRequest::new("student-7", "course-3", "learning_path")
        .with_feature("completed_units", json!(14));
    let outcome = orchestrator.get_or_compute(&deferred_request).await;
    assert!(matches!(outcome, Err(CoreError::CacheUnavailable { .. })));

    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn inline_timeout_surfaces_and_releases_the_marker() {
    let backend = Arc::new(
        ScriptedBackend::returning(json!(0.5)).with_delay(Duration::from_millis(500)),
    );
    let mut config = OrchestratorConfig::default();
    config.models.insert(
        "dropout_risk".to_string(),
        ModelProfile {
            execution: ExecutionMode::Inline,
            ttl_secs: None,
            inline_timeout_ms: Some(50),
        },
    );
    let pipeline = build(config, backend.clone());

    let request = dropout_request();
    let fp = fingerprint(&request);
    let outcome = pipeline.orchestrator.get_or_compute(&request).await;
    assert!(matches!(outcome, Err(CoreError::InferenceTimeout { .. })));
    assert!(pipeline.cache.get(&fp.marker_key()).await.unwrap().is_none());
    assert!(pipeline.cache.get(&fp.entry_key()).await.unwrap().is_none());
}

#[tokio::test]
async fn expired_entries_trigger_recomputation() {
    let backend = Arc::new(ScriptedBackend::returning(json!(0.3)));
    let mut config = OrchestratorConfig::default();
    config.models.insert(
        "dropout_risk".to_string(),
        ModelProfile {
            execution: ExecutionMode::Inline,
            ttl_secs: Some(1),
            inline_timeout_ms: None,
        },
    );
    let pipeline = build(config, backend.clone());
    let request = dropout_request();

    pipeline.orchestrator.get_or_compute(&request).await.unwrap();
    assert_eq!(backend.calls(), 1);

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let outcome = pipeline.orchestrator.get_or_compute(&request).await.unwrap();
    assert!(outcome.prediction().is_some());
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn worker_pool_drains_on_shutdown() {
    let backend = Arc::new(
        ScriptedBackend::returning(json!(0.2)).with_delay(Duration::from_millis(30)),
    );
    let pipeline = build(deferred_config("auto_grading"), backend.clone());
    let request = PredictionRequest::new("student-5", "assignment-12", "auto_grading")
        .with_feature("essay_length", json!(412));

    let outcome = pipeline.orchestrator.get_or_compute(&request).await.unwrap();
    let job_id = pending_job_id(&outcome);

    pipeline.queue.shutdown().await;

    // The accepted job ran to completion before the pool stopped
    assert_eq!(
        pipeline.queue.status(job_id).await.unwrap(),
        Some(JobStatus::Succeeded)
    );

    // New work is refused once the pool is shut down
    let request = dropout_request();
    let descriptor = JobDescriptor::new(fingerprint(&request), request);
    assert!(matches!(
        pipeline.queue.enqueue(descriptor).await,
        Err(CoreError::QueueUnavailable { .. })
    ));
}
