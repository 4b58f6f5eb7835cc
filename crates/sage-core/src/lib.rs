//! Sage Core - Prediction Serving Engine
//!
//! This crate provides the prediction-serving core for the Sage learning
//! platform: cache-key derivation, cached-result lookup and population,
//! deduplication of concurrent identical requests, background job dispatch
//! with retry, and completion tracking around model inference.
//!
//! The pipeline consumes two external capabilities — a
//! [`cache::CacheStore`] and a [`jobs::JobQueue`] — plus a
//! [`backend::InferenceBackend`], and exposes a single get-or-compute
//! operation to the API layer via [`PredictionOrchestrator`].

// Module declarations
pub mod backend;
pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod inflight;
pub mod jobs;
pub mod materializer;
pub mod orchestrator;
pub mod prediction;
pub mod validation;

use thiserror::Error;

/// Errors produced by the prediction pipeline.
///
/// Each variant carries a stable machine-readable code (see
/// [`CoreError::code`]) so the API layer can map errors to transport
/// status without string matching.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The shared cache store could not be reached or answered with a
    /// store-level failure.
    #[error("cache store unavailable: {message}")]
    CacheUnavailable { message: String },

    /// The job broker refused or failed to accept work.
    #[error("job queue unavailable: {message}")]
    QueueUnavailable { message: String },

    /// The inference backend has no serving copy of the requested model.
    #[error("model '{model}' unavailable: {message}")]
    ModelUnavailable { model: String, message: String },

    /// An inference call exceeded its time budget.
    #[error("inference for model '{model}' timed out after {timeout_ms} ms")]
    InferenceTimeout { model: String, timeout_ms: u64 },

    /// The request failed validation; never retried and never cached.
    #[error("invalid input: {message}")]
    InvalidInput {
        message: String,
        parameter: Option<String>,
    },

    /// The computation a follower was waiting on ended in terminal failure.
    #[error("computation for fingerprint {fingerprint} failed: {reason}")]
    ComputationFailed { fingerprint: String, reason: String },

    /// Configuration parsing or validation errors.
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Other unexpected errors.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create an invalid input error without parameter details
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
            parameter: None,
        }
    }

    /// Create an invalid input error tied to a named parameter
    pub fn invalid_parameter<S1, S2>(message: S1, parameter: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::InvalidInput {
            message: message.into(),
            parameter: Some(parameter.into()),
        }
    }

    /// Create a configuration error tied to a named field
    pub fn configuration<S1, S2>(message: S1, field: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S, source: Option<anyhow::Error>) -> Self {
        Self::Internal {
            message: message.into(),
            source,
        }
    }

    /// Get the error code for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            Self::CacheUnavailable { .. } => "CACHE_UNAVAILABLE",
            Self::QueueUnavailable { .. } => "QUEUE_UNAVAILABLE",
            Self::ModelUnavailable { .. } => "MODEL_UNAVAILABLE",
            Self::InferenceTimeout { .. } => "INFERENCE_TIMEOUT",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::ComputationFailed { .. } => "COMPUTATION_FAILED",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Whether the job layer may retry after this error.
    ///
    /// Only backend-level transient failures are retryable; everything else
    /// terminates the attempt loop immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ModelUnavailable { .. } | Self::InferenceTimeout { .. }
        )
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        backend::{Inference, InferenceBackend},
        cache::{CacheEntry, CacheStats, CacheStore, InMemoryCacheStore},
        config::{ExecutionMode, FollowerMode, ModelProfile, OrchestratorConfig, RetryPolicy},
        fingerprint::{fingerprint, Fingerprint},
        inflight::{FlightBoard, FlightVerdict, InFlightMarker},
        jobs::{InMemoryJobQueue, JobDescriptor, JobQueue, JobRecord, JobStatus},
        materializer::ResultMaterializer,
        orchestrator::PredictionOrchestrator,
        prediction::{Prediction, PredictionOutcome, PredictionRequest, PredictionSource},
        validation::Validator,
        CoreError, Result,
    };
}

// Re-export key types at the crate root
pub use config::OrchestratorConfig;
pub use fingerprint::Fingerprint;
pub use orchestrator::PredictionOrchestrator;
pub use prediction::{PredictionOutcome, PredictionRequest};
