//! Prediction request and result types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Version tag used when a request does not pin a model version.
pub const DEFAULT_MODEL_VERSION: &str = "latest";

/// A single prediction request as handed over by the API layer.
///
/// Immutable once constructed; the orchestrator derives the cache
/// fingerprint from it and never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    /// Learner the prediction is about
    pub subject_id: String,

    /// Course, lesson or assignment the prediction applies to
    pub content_id: String,

    /// Model class to invoke (e.g. "dropout_risk", "learning_path")
    pub model_name: String,

    /// Pinned model version; `None` resolves to [`DEFAULT_MODEL_VERSION`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,

    /// Feature name to value mapping fed to the model
    pub input_features: BTreeMap<String, Value>,
}

impl PredictionRequest {
    /// Create a request for the latest version of a model
    pub fn new<S1, S2, S3>(subject_id: S1, content_id: S2, model_name: S3) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self {
            subject_id: subject_id.into(),
            content_id: content_id.into(),
            model_name: model_name.into(),
            model_version: None,
            input_features: BTreeMap::new(),
        }
    }

    /// Pin an explicit model version
    pub fn with_version<S: Into<String>>(mut self, version: S) -> Self {
        self.model_version = Some(version.into());
        self
    }

    /// Add a single input feature
    pub fn with_feature<S: Into<String>, V: Into<Value>>(mut self, name: S, value: V) -> Self {
        self.input_features.insert(name.into(), value.into());
        self
    }

    /// Replace the whole feature mapping
    pub fn with_features(mut self, features: BTreeMap<String, Value>) -> Self {
        self.input_features = features;
        self
    }

    /// The model version this request resolves to
    pub fn resolved_version(&self) -> &str {
        self.model_version.as_deref().unwrap_or(DEFAULT_MODEL_VERSION)
    }
}

/// Where a served prediction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionSource {
    /// Freshly computed by the inference backend during this request
    Computed,
    /// Served from the shared cache store
    Cache,
}

/// A completed prediction, ready to hand back to the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Model output value (scalar score or structured recommendation)
    pub value: Value,

    /// Version of the model that actually produced the value
    pub model_version: String,

    /// When the value was computed
    pub computed_at: DateTime<Utc>,

    /// Cache hit or fresh computation
    pub source: PredictionSource,
}

/// Result of a get-or-compute call.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionOutcome {
    /// A prediction value is available now
    Ready(Prediction),

    /// Computation is in flight; poll again later.
    ///
    /// `job_id` is present when the computation runs as a background job;
    /// inline computations in flight on another caller carry no job.
    Pending { job_id: Option<Uuid> },
}

impl PredictionOutcome {
    /// The prediction value, if one is available
    pub fn prediction(&self) -> Option<&Prediction> {
        match self {
            Self::Ready(prediction) => Some(prediction),
            Self::Pending { .. } => None,
        }
    }

    /// Whether the caller should poll again later
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }
}
