//! Configuration for the prediction orchestrator

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::{CoreError, Result};

/// Main configuration for the prediction pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// How callers behind an in-flight computation behave
    pub follower: FollowerConfig,

    /// Inline computation limits
    pub inline: InlineConfig,

    /// Retry policy applied by the job layer
    pub retry: RetryPolicy,

    /// Cache entry and in-flight marker lifetimes
    pub cache: CacheSettings,

    /// Background worker pool settings
    pub queue: QueueConfig,

    /// Per-model overrides, keyed by model name
    pub models: HashMap<String, ModelProfile>,
}

/// Follower behavior when a computation is already in flight
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowerConfig {
    /// Poll (return Pending immediately) or block until resolution
    pub mode: FollowerMode,

    /// Maximum blocking wait before the caller is told to poll
    pub block_timeout_ms: u64,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            mode: FollowerMode::Poll,
            block_timeout_ms: 5_000,
        }
    }
}

/// Whether deferred results are awaited in-request or polled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowerMode {
    /// Return `Pending` immediately; the caller polls
    Poll,
    /// Block on the in-process notification, bounded by the timeout
    Block,
}

/// Inline computation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InlineConfig {
    /// Mandatory time budget for an inline inference call
    pub timeout_ms: u64,
}

impl Default for InlineConfig {
    fn default() -> Self {
        Self { timeout_ms: 2_000 }
    }
}

/// Retry policy for background inference attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts before a job fails terminally
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles per attempt
    pub base_delay_ms: u64,

    /// Upper bound on a single backoff delay
    pub max_delay_ms: u64,

    /// Randomize delays to spread retry bursts
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

/// Cache entry and in-flight marker lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Entry lifetime for models without an override
    pub default_ttl_secs: u64,

    /// Age after which an in-flight marker is presumed orphaned
    pub inflight_stale_after_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3_600,
            inflight_stale_after_secs: 300,
        }
    }
}

/// Background worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Worker tasks consuming the job channel
    pub workers: usize,

    /// Time budget for a single inference attempt on a worker
    pub attempt_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            attempt_timeout_ms: 30_000,
        }
    }
}

/// Per-model serving profile
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelProfile {
    /// Inline (compute during the request) or deferred (background job)
    pub execution: ExecutionMode,

    /// Entry lifetime override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,

    /// Inline time budget override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_timeout_ms: Option<u64>,
}

/// Where a model class computes on a cache miss
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Invoke the backend during the request, under the inline timeout
    #[default]
    Inline,
    /// Enqueue a background job and return `Pending`
    Deferred,
}

impl OrchestratorConfig {
    /// Profile for a model, falling back to the default profile for
    /// models without an override
    pub fn profile(&self, model_name: &str) -> ModelProfile {
        self.models.get(model_name).cloned().unwrap_or_default()
    }

    /// Cache entry lifetime for a model
    pub fn ttl_for(&self, model_name: &str) -> Duration {
        let secs = self
            .models
            .get(model_name)
            .and_then(|profile| profile.ttl_secs)
            .unwrap_or(self.cache.default_ttl_secs);
        Duration::from_secs(secs)
    }

    /// Inline time budget for a profile
    pub fn inline_timeout_for(&self, profile: &ModelProfile) -> Duration {
        Duration::from_millis(profile.inline_timeout_ms.unwrap_or(self.inline.timeout_ms))
    }

    /// Age at which in-flight markers may be reclaimed
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.cache.inflight_stale_after_secs)
    }

    /// Maximum blocking follower wait
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.follower.block_timeout_ms)
    }

    /// Time budget for one worker-side inference attempt
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.attempt_timeout_ms)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            CoreError::Configuration {
                message: format!(
                    "cannot read config file {}: {}",
                    path.as_ref().display(),
                    err
                ),
                field: None,
            }
        })?;
        let config: Self = toml::from_str(&content).map_err(|err| CoreError::Configuration {
            message: format!("cannot parse config file: {}", err),
            field: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|err| CoreError::Configuration {
            message: format!("cannot serialize config: {}", err),
            field: None,
        })?;
        std::fs::write(path.as_ref(), content).map_err(|err| CoreError::Configuration {
            message: format!(
                "cannot write config file {}: {}",
                path.as_ref().display(),
                err
            ),
            field: None,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.inline.timeout_ms == 0 {
            return Err(CoreError::configuration(
                "inline timeout must be greater than 0",
                "inline.timeout_ms",
            ));
        }
        if self.follower.block_timeout_ms == 0 {
            return Err(CoreError::configuration(
                "follower block timeout must be greater than 0",
                "follower.block_timeout_ms",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::configuration(
                "at least one attempt is required",
                "retry.max_attempts",
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(CoreError::configuration(
                "base delay must not exceed the delay cap",
                "retry.base_delay_ms",
            ));
        }
        if self.cache.default_ttl_secs == 0 {
            return Err(CoreError::configuration(
                "default TTL must be greater than 0",
                "cache.default_ttl_secs",
            ));
        }
        if self.cache.inflight_stale_after_secs == 0 {
            return Err(CoreError::configuration(
                "staleness timeout must be greater than 0",
                "cache.inflight_stale_after_secs",
            ));
        }
        if self.queue.workers == 0 {
            return Err(CoreError::configuration(
                "worker pool must have at least one worker",
                "queue.workers",
            ));
        }
        if self.queue.attempt_timeout_ms == 0 {
            return Err(CoreError::configuration(
                "attempt timeout must be greater than 0",
                "queue.attempt_timeout_ms",
            ));
        }
        for (model_name, profile) in &self.models {
            if profile.ttl_secs == Some(0) {
                return Err(CoreError::configuration(
                    format!("TTL override for model '{}' must be greater than 0", model_name),
                    "models.ttl_secs",
                ));
            }
            if profile.inline_timeout_ms == Some(0) {
                return Err(CoreError::configuration(
                    format!(
                        "inline timeout override for model '{}' must be greater than 0",
                        model_name
                    ),
                    "models.inline_timeout_ms",
                ));
            }
        }
        Ok(())
    }
}
