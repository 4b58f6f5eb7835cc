//! Prediction orchestrator: get-or-compute with duplicate suppression
//!
//! For each request the orchestrator derives a fingerprint, consults the
//! cache store, and on a miss races for leadership through an atomic
//! create-if-absent of the in-flight marker. The leader computes (inline
//! or via the job queue); followers either poll or block on the flight
//! notification. At most one backend invocation per fingerprint is in
//! flight at any time, modulo the staleness-recovery window.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::InferenceBackend;
use crate::cache::{CacheEntry, CacheStore};
use crate::config::{ExecutionMode, FollowerMode, ModelProfile, OrchestratorConfig};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::inflight::{FlightBoard, FlightVerdict, InFlightMarker};
use crate::jobs::{JobDescriptor, JobQueue, JobStatus};
use crate::materializer::ResultMaterializer;
use crate::prediction::{Prediction, PredictionOutcome, PredictionRequest, PredictionSource};
use crate::validation::Validator;
use crate::{CoreError, Result};

/// Attempts to claim or reclaim the in-flight marker before giving up.
/// Each retry follows either an orphan reclamation or a marker that
/// vanished between the claim and the read.
const MARKER_CLAIM_ATTEMPTS: u32 = 4;

/// The get-or-compute entry point of the prediction pipeline.
///
/// All collaborators are injected; the orchestrator owns no global
/// state and is shared across request handlers via `Arc`.
pub struct PredictionOrchestrator {
    config: Arc<OrchestratorConfig>,
    cache: Arc<dyn CacheStore>,
    queue: Arc<dyn JobQueue>,
    backend: Arc<dyn InferenceBackend>,
    flights: Arc<FlightBoard>,
    materializer: Arc<ResultMaterializer>,
}

impl PredictionOrchestrator {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        cache: Arc<dyn CacheStore>,
        queue: Arc<dyn JobQueue>,
        backend: Arc<dyn InferenceBackend>,
        flights: Arc<FlightBoard>,
        materializer: Arc<ResultMaterializer>,
    ) -> Self {
        Self {
            config,
            cache,
            queue,
            backend,
            flights,
            materializer,
        }
    }

    /// Serve a prediction: cached if fresh, otherwise computed inline or
    /// dispatched to the background pool, with at most one concurrent
    /// computation per fingerprint.
    pub async fn get_or_compute(&self, request: &PredictionRequest) -> Result<PredictionOutcome> {
        Validator::validate_request(request)?;
        let fp = fingerprint(request);
        let profile = self.config.profile(&request.model_name);

        match self.lookup(&fp).await {
            Ok(Some(prediction)) => {
                debug!(fingerprint = %fp, model = %request.model_name, "cache hit");
                return Ok(PredictionOutcome::Ready(prediction));
            }
            Ok(None) => {}
            Err(CoreError::CacheUnavailable { message }) => {
                return self.compute_degraded(request, &profile, &message).await;
            }
            Err(err) => return Err(err),
        }

        // Deferred leaders assign the job id up front so the marker can
        // carry it for followers.
        let pending_job = match profile.execution {
            ExecutionMode::Deferred => Some(Uuid::new_v4()),
            ExecutionMode::Inline => None,
        };
        let marker = InFlightMarker::new(&fp, pending_job);
        let marker_payload = marker.encode()?;
        let marker_ttl = self.config.stale_after();

        let mut leader = false;
        for _ in 0..MARKER_CLAIM_ATTEMPTS {
            if self
                .cache
                .set_if_absent(&fp.marker_key(), &marker_payload, Some(marker_ttl))
                .await?
            {
                leader = true;
                break;
            }

            let existing = match self.cache.get(&fp.marker_key()).await? {
                Some(raw) => match InFlightMarker::decode(&raw) {
                    Ok(existing) => existing,
                    Err(err) => {
                        // Unreadable marker: treat like an orphan so it
                        // cannot wedge the fingerprint forever.
                        warn!(fingerprint = %fp, error = %err, "dropping undecodable in-flight marker");
                        self.cache.delete(&fp.marker_key()).await?;
                        continue;
                    }
                },
                // Marker vanished between claim and read; race again.
                None => continue,
            };

            if existing.is_stale(self.config.stale_after()) {
                warn!(
                    fingerprint = %fp,
                    age_secs = existing.age().as_secs(),
                    "reclaiming orphaned in-flight marker"
                );
                self.cache.delete(&fp.marker_key()).await?;
                continue;
            }

            debug!(fingerprint = %fp, job_id = ?existing.job_id, "following in-flight computation");
            return self.follow(&fp, existing).await;
        }

        if !leader {
            return Err(CoreError::internal(
                "could not claim or follow the in-flight marker",
                None,
            ));
        }

        // Double-check after claiming: a prior flight may have materialized
        // between our miss and the claim. Release the marker instead of
        // recomputing.
        if let Some(prediction) = self.lookup(&fp).await? {
            self.cache.delete(&fp.marker_key()).await?;
            self.flights.resolve(&fp, FlightVerdict::Materialized);
            return Ok(PredictionOutcome::Ready(prediction));
        }

        match pending_job {
            Some(job_id) => self.dispatch(request, &fp, job_id).await,
            None => self.compute_inline(request, &fp, &profile).await,
        }
    }

    /// Status passthrough for polling deferred jobs
    pub async fn job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        self.queue.status(job_id).await
    }

    /// Fresh entry for a fingerprint, if the store has one
    async fn lookup(&self, fp: &Fingerprint) -> Result<Option<Prediction>> {
        let raw = match self.cache.get(&fp.entry_key()).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let entry = match CacheEntry::decode(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(fingerprint = %fp, error = %err, "dropping undecodable cache entry");
                self.cache.delete(&fp.entry_key()).await?;
                return Ok(None);
            }
        };
        if entry.is_fresh(Utc::now()) {
            Ok(Some(entry.into_prediction(PredictionSource::Cache)))
        } else {
            debug!(fingerprint = %fp, "cache entry expired");
            Ok(None)
        }
    }

    /// Leader inline path: one backend call under the mandatory timeout.
    /// No retry at this layer; the caller decides whether to retry the
    /// whole request.
    async fn compute_inline(
        &self,
        request: &PredictionRequest,
        fp: &Fingerprint,
        profile: &ModelProfile,
    ) -> Result<PredictionOutcome> {
        let budget = self.config.inline_timeout_for(profile);
        let outcome = tokio::time::timeout(
            budget,
            self.backend.infer(
                &request.model_name,
                request.resolved_version(),
                &request.input_features,
            ),
        )
        .await;

        match outcome {
            Ok(Ok(inference)) => {
                let prediction = self
                    .materializer
                    .record_success(fp, &request.model_name, inference)
                    .await?;
                info!(
                    fingerprint = %fp,
                    model = %request.model_name,
                    "inline prediction computed"
                );
                Ok(PredictionOutcome::Ready(prediction))
            }
            Ok(Err(err)) => {
                self.materializer.record_failure(fp, &err.to_string()).await;
                Err(err)
            }
            Err(_) => {
                let err = CoreError::InferenceTimeout {
                    model: request.model_name.clone(),
                    timeout_ms: budget.as_millis() as u64,
                };
                self.materializer.record_failure(fp, &err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Leader deferred path: hand the computation to the job queue
    async fn dispatch(
        &self,
        request: &PredictionRequest,
        fp: &Fingerprint,
        job_id: Uuid,
    ) -> Result<PredictionOutcome> {
        let descriptor = JobDescriptor {
            job_id,
            fingerprint: fp.clone(),
            request: request.clone(),
        };
        match self.queue.enqueue(descriptor).await {
            Ok(job_id) => {
                debug!(fingerprint = %fp, job_id = %job_id, "prediction job dispatched");
                Ok(PredictionOutcome::Pending {
                    job_id: Some(job_id),
                })
            }
            Err(err) => {
                self.materializer
                    .record_failure(fp, "job dispatch failed")
                    .await;
                Err(err)
            }
        }
    }

    /// Follower path: poll or block per configuration
    async fn follow(&self, fp: &Fingerprint, marker: InFlightMarker) -> Result<PredictionOutcome> {
        match self.config.follower.mode {
            FollowerMode::Poll => Ok(PredictionOutcome::Pending {
                job_id: marker.job_id,
            }),
            FollowerMode::Block => self.await_flight(fp, marker).await,
        }
    }

    /// Block until the in-flight computation resolves, bounded by the
    /// follower wait budget. Every wakeup re-checks shared state; the
    /// notification is only a hint.
    async fn await_flight(
        &self,
        fp: &Fingerprint,
        marker: InFlightMarker,
    ) -> Result<PredictionOutcome> {
        let deadline = tokio::time::Instant::now() + self.config.block_timeout();
        let slot = self.flights.slot(fp);

        loop {
            let mut notified = std::pin::pin!(slot.notified());
            notified.as_mut().enable();

            if let Some(prediction) = self.lookup(fp).await? {
                return Ok(PredictionOutcome::Ready(prediction));
            }

            if self.cache.get(&fp.marker_key()).await?.is_none() {
                // The flight resolved; success would have left an entry.
                if let Some(prediction) = self.lookup(fp).await? {
                    return Ok(PredictionOutcome::Ready(prediction));
                }
                let reason = match slot.verdict() {
                    Some(FlightVerdict::Failed { reason }) => reason,
                    _ => "in-flight computation ended without a result".to_string(),
                };
                return Err(CoreError::ComputationFailed {
                    fingerprint: fp.to_string(),
                    reason,
                });
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(fingerprint = %fp, "follower wait budget exhausted");
                return Ok(PredictionOutcome::Pending {
                    job_id: marker.job_id,
                });
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    /// Cache store is down: inline models compute without deduplication
    /// or caching, deferred models fail with a retry-later signal.
    async fn compute_degraded(
        &self,
        request: &PredictionRequest,
        profile: &ModelProfile,
        message: &str,
    ) -> Result<PredictionOutcome> {
        if profile.execution != ExecutionMode::Inline {
            return Err(CoreError::CacheUnavailable {
                message: message.to_string(),
            });
        }

        warn!(
            model = %request.model_name,
            error = message,
            "cache store unavailable, computing inline without dedup"
        );
        let budget = self.config.inline_timeout_for(profile);
        let outcome = tokio::time::timeout(
            budget,
            self.backend.infer(
                &request.model_name,
                request.resolved_version(),
                &request.input_features,
            ),
        )
        .await;

        match outcome {
            Ok(Ok(inference)) => Ok(PredictionOutcome::Ready(Prediction {
                value: inference.value,
                model_version: inference.version_used,
                computed_at: Utc::now(),
                source: PredictionSource::Computed,
            })),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(CoreError::InferenceTimeout {
                model: request.model_name.clone(),
                timeout_ms: budget.as_millis() as u64,
            }),
        }
    }
}
