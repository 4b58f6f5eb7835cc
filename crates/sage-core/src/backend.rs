//! Inference backend capability
//!
//! The pipeline never talks to a model directly; it consumes this trait.
//! Deployments plug in whatever serves their models — an in-process
//! scorer, or the remote adapter in [`remote`] forwarding to a model
//! server over HTTP.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::Result;

#[cfg(feature = "remote-backend")]
pub mod remote;

/// A completed inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inference {
    /// Model output value
    pub value: Value,

    /// Version that actually served the request; may differ from the
    /// requested version when the request asked for "latest"
    pub version_used: String,
}

/// Capability to run a model over a feature mapping.
///
/// Implementations are assumed slow (tens to thousands of milliseconds)
/// and occasionally unavailable. Errors: `ModelUnavailable`,
/// `InferenceTimeout`, `InvalidInput`.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn infer(
        &self,
        model_name: &str,
        model_version: &str,
        features: &BTreeMap<String, Value>,
    ) -> Result<Inference>;
}
