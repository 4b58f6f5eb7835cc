//! HTTP adapter forwarding inference to a remote model server

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::backend::{Inference, InferenceBackend};
use crate::{CoreError, Result};

/// Connection settings for the remote model server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteBackendConfig {
    /// Inference endpoint, e.g. `http://models.internal:8501/v1/infer`
    pub endpoint: String,

    /// Bearer token sent with every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Per-request timeout
    pub request_timeout_ms: u64,
}

impl Default for RemoteBackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8501/v1/infer".to_string(),
            api_key: None,
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Serialize)]
struct InferRequestBody<'a> {
    model_name: &'a str,
    model_version: &'a str,
    input_features: &'a BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct InferResponseBody {
    value: Value,
    version_used: String,
}

/// [`InferenceBackend`] talking JSON over HTTP to a model server.
pub struct RemoteBackend {
    client: Client,
    config: RemoteBackendConfig,
}

impl RemoteBackend {
    pub fn new(config: RemoteBackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|err| {
                CoreError::internal("failed to build HTTP client", Some(err.into()))
            })?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl InferenceBackend for RemoteBackend {
    async fn infer(
        &self,
        model_name: &str,
        model_version: &str,
        features: &BTreeMap<String, Value>,
    ) -> Result<Inference> {
        let body = InferRequestBody {
            model_name,
            model_version,
            input_features: features,
        };

        let mut request = self.client.post(&self.config.endpoint).json(&body);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                CoreError::InferenceTimeout {
                    model: model_name.to_string(),
                    timeout_ms: self.config.request_timeout_ms,
                }
            } else {
                CoreError::ModelUnavailable {
                    model: model_name.to_string(),
                    message: err.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            let detail = response.text().await.unwrap_or_default();
            return Err(CoreError::invalid_input(format!(
                "model server rejected the request: {}",
                detail
            )));
        }
        if !status.is_success() {
            return Err(CoreError::ModelUnavailable {
                model: model_name.to_string(),
                message: format!("model server answered {}", status),
            });
        }

        let reply: InferResponseBody = response.json().await.map_err(|err| {
            CoreError::ModelUnavailable {
                model: model_name.to_string(),
                message: format!("malformed model server response: {}", err),
            }
        })?;

        debug!(
            model = model_name,
            version = %reply.version_used,
            "remote inference completed"
        );
        Ok(Inference {
            value: reply.value,
            version_used: reply.version_used,
        })
    }
}
