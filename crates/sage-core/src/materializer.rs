//! Result materialization on computation completion
//!
//! Both leader paths end here: a successful inference becomes a cache
//! entry, the in-flight marker is released, and waiting followers are
//! woken. A terminal failure releases the marker without writing an
//! entry, so the next request triggers a fresh attempt instead of
//! replaying a cached failure.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::Inference;
use crate::cache::{CacheEntry, CacheStore};
use crate::config::OrchestratorConfig;
use crate::fingerprint::Fingerprint;
use crate::inflight::{FlightBoard, FlightVerdict};
use crate::prediction::{Prediction, PredictionSource};
use crate::Result;

/// Writes computation outcomes back into the shared store and releases
/// in-flight state.
pub struct ResultMaterializer {
    cache: Arc<dyn CacheStore>,
    flights: Arc<FlightBoard>,
    config: Arc<OrchestratorConfig>,
}

impl ResultMaterializer {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        flights: Arc<FlightBoard>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            cache,
            flights,
            config,
        }
    }

    /// Record a successful computation.
    ///
    /// A failing cache write degrades to serving the value uncached (the
    /// next request recomputes); the marker is always released so
    /// followers never starve on a store hiccup.
    pub async fn record_success(
        &self,
        fingerprint: &Fingerprint,
        model_name: &str,
        inference: Inference,
    ) -> Result<Prediction> {
        let ttl = self.config.ttl_for(model_name);
        let entry = CacheEntry::new(fingerprint, inference, ttl);
        let payload = entry.encode()?;

        if let Err(err) = self
            .cache
            .set(&fingerprint.entry_key(), &payload, Some(ttl))
            .await
        {
            warn!(
                fingerprint = %fingerprint,
                error = %err,
                "cache write failed, serving result uncached"
            );
        }
        self.release(fingerprint).await;
        self.flights.resolve(fingerprint, FlightVerdict::Materialized);

        debug!(
            fingerprint = %fingerprint,
            model = model_name,
            ttl_secs = ttl.as_secs(),
            "prediction materialized"
        );
        Ok(entry.into_prediction(PredictionSource::Computed))
    }

    /// Record a terminal failure: release the marker, wake followers,
    /// write nothing.
    pub async fn record_failure(&self, fingerprint: &Fingerprint, reason: &str) {
        self.release(fingerprint).await;
        self.flights.resolve(
            fingerprint,
            FlightVerdict::Failed {
                reason: reason.to_string(),
            },
        );
        debug!(fingerprint = %fingerprint, reason, "computation failure recorded");
    }

    async fn release(&self, fingerprint: &Fingerprint) {
        if let Err(err) = self.cache.delete(&fingerprint.marker_key()).await {
            // The marker TTL bounds how long followers can be blocked by
            // this failure.
            warn!(
                fingerprint = %fingerprint,
                error = %err,
                "failed to release in-flight marker"
            );
        }
    }
}
