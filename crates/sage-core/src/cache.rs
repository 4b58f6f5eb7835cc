//! Cache store capability and the in-memory reference implementation
//!
//! The orchestrator talks to a shared TTL key-value store through the
//! [`CacheStore`] trait. Production deployments back it with a store
//! shared across process instances; tests and single-process deployments
//! use [`InMemoryCacheStore`]. The store holds serialized JSON payloads
//! so the same entry format works against any backing store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::backend::Inference;
use crate::fingerprint::Fingerprint;
use crate::prediction::{Prediction, PredictionSource};
use crate::{CoreError, Result};

/// Shared TTL key-value store.
///
/// All operations must be safe under concurrent access from multiple
/// processes; `set_if_absent` must be atomic, it is what the
/// leader/follower protocol rests on.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the payload stored under `key`, if present and unexpired
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, overwriting any existing payload
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Store `value` under `key` only if the key is currently absent.
    /// Returns `true` if this call created the entry.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Remove `key`; removing an absent key is not an error
    async fn delete(&self, key: &str) -> Result<()>;
}

/// A cached prediction result as serialized into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint the entry was computed for
    pub fingerprint: String,

    /// Model output value
    pub value: Value,

    /// Version of the model that produced the value
    pub model_version: String,

    /// When the value was computed
    pub computed_at: DateTime<Utc>,

    /// Lifetime of the entry from `computed_at`
    pub ttl_seconds: u64,
}

impl CacheEntry {
    /// Build an entry from a completed inference
    pub fn new(fingerprint: &Fingerprint, inference: Inference, ttl: Duration) -> Self {
        Self {
            fingerprint: fingerprint.as_str().to_string(),
            value: inference.value,
            model_version: inference.version_used,
            computed_at: Utc::now(),
            ttl_seconds: ttl.as_secs(),
        }
    }

    /// Whether the entry is still valid at `now`.
    ///
    /// The backing store also enforces TTL, but the core never assumes
    /// entries survive past their lifetime.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.computed_at);
        match age.to_std() {
            Ok(age) => age < Duration::from_secs(self.ttl_seconds),
            // computed_at in the future (clock skew): treat as fresh
            Err(_) => true,
        }
    }

    /// Serialize for storage
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|err| CoreError::internal("failed to encode cache entry", Some(err.into())))
    }

    /// Deserialize from storage
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| CoreError::internal("failed to decode cache entry", Some(err.into())))
    }

    /// Convert into an API-facing prediction
    pub fn into_prediction(self, source: PredictionSource) -> Prediction {
        Prediction {
            value: self.value,
            model_version: self.model_version,
            computed_at: self.computed_at,
            source,
        }
    }
}

/// Counters exposed by [`InMemoryCacheStore`].
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Lookups that returned a live payload
    pub hits: u64,
    /// Lookups that found nothing (or only an expired payload)
    pub misses: u64,
    /// Payloads written (set and successful set_if_absent)
    pub insertions: u64,
    /// Expired payloads dropped during reads or writes
    pub expirations: u64,
}

#[derive(Debug, Clone)]
struct StoredValue {
    payload: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(payload: &str, ttl: Option<Duration>) -> Self {
        Self {
            payload: payload.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

/// Process-local [`CacheStore`] used by tests and single-node deployments.
///
/// TTL is enforced lazily on access; an expired payload behaves exactly
/// like an absent key, including for `set_if_absent`.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<String, StoredValue>,
    stats: RwLock<CacheStats>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the store counters
    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    /// Number of payloads currently held, including not-yet-reaped
    /// expired ones
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired payload now instead of waiting for lazy reaping
    pub fn purge_expired(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, stored| !stored.is_expired());
        let removed = before - self.entries.len();
        if removed > 0 {
            self.stats.write().expirations += removed as u64;
            debug!(removed, "purged expired cache payloads");
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let payload = match self.entries.get(key) {
            Some(stored) if !stored.is_expired() => Some(stored.payload.clone()),
            Some(_) => None,
            None => None,
        };

        if payload.is_some() {
            self.stats.write().hits += 1;
            trace!(key, "cache hit");
            return Ok(payload);
        }

        // Reap lazily so an expired payload does not linger
        if self
            .entries
            .remove_if(key, |_, stored| stored.is_expired())
            .is_some()
        {
            self.stats.write().expirations += 1;
        }
        self.stats.write().misses += 1;
        trace!(key, "cache miss");
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        self.stats.write().insertions += 1;
        trace!(key, ttl_secs = ttl.map(|t| t.as_secs()), "cache set");
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let created = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredValue::new(value, ttl));
                    let mut stats = self.stats.write();
                    stats.expirations += 1;
                    stats.insertions += 1;
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl));
                self.stats.write().insertions += 1;
                true
            }
        };
        trace!(key, created, "cache set_if_absent");
        Ok(created)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        trace!(key, "cache delete");
        Ok(())
    }
}
