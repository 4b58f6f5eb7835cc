//! In-flight computation tracking
//!
//! An [`InFlightMarker`] lives in the shared store and is what makes one
//! caller the leader for a fingerprint: it is created with an atomic
//! create-if-absent, deleted on completion, and reclaimable once it
//! exceeds the staleness timeout (the owner is presumed crashed).
//!
//! The [`FlightBoard`] is the process-local side: a per-fingerprint
//! notification that blocking followers wait on. Followers in other
//! processes poll the shared store instead.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::fingerprint::Fingerprint;
use crate::{CoreError, Result};

/// Marker recording that a computation for a fingerprint is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InFlightMarker {
    /// Fingerprint being computed
    pub fingerprint: String,

    /// Background job carrying the computation; `None` for inline flights
    pub job_id: Option<Uuid>,

    /// When the computation started
    pub created_at: DateTime<Utc>,
}

impl InFlightMarker {
    /// Create a marker for a computation starting now
    pub fn new(fingerprint: &Fingerprint, job_id: Option<Uuid>) -> Self {
        Self {
            fingerprint: fingerprint.as_str().to_string(),
            job_id,
            created_at: Utc::now(),
        }
    }

    /// Time since the computation started.
    ///
    /// A `created_at` in the future (clock skew between instances) reads
    /// as zero age.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Whether the owning computation is presumed crashed
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() >= max_age
    }

    /// Serialize for storage
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| {
            CoreError::internal("failed to encode in-flight marker", Some(err.into()))
        })
    }

    /// Deserialize from storage
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|err| {
            CoreError::internal("failed to decode in-flight marker", Some(err.into()))
        })
    }
}

/// Terminal state of a flight, as seen by waiting followers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlightVerdict {
    /// The result was written to the cache store
    Materialized,
    /// The computation failed; no cache entry was written
    Failed { reason: String },
}

/// Wait handle for a single fingerprint.
#[derive(Debug, Default)]
pub struct FlightSlot {
    notify: Notify,
    verdict: Mutex<Option<FlightVerdict>>,
}

impl FlightSlot {
    /// Future resolving on the next flight resolution.
    ///
    /// Call `enable` on the pinned future before re-checking shared state
    /// so a resolution between the check and the await is not missed.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// The recorded verdict, once the flight resolved
    pub fn verdict(&self) -> Option<FlightVerdict> {
        self.verdict.lock().clone()
    }
}

/// Process-local registry of per-fingerprint wait handles.
#[derive(Debug, Default)]
pub struct FlightBoard {
    slots: DashMap<String, Arc<FlightSlot>>,
}

impl FlightBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait handle for a fingerprint, created on first use
    pub fn slot(&self, fingerprint: &Fingerprint) -> Arc<FlightSlot> {
        self.slots
            .entry(fingerprint.as_str().to_string())
            .or_insert_with(|| Arc::new(FlightSlot::default()))
            .clone()
    }

    /// Resolve the flight for a fingerprint and wake every waiter.
    ///
    /// The slot is detached from the board first, so waiters that joined
    /// before resolution read this verdict while later callers start a
    /// fresh slot.
    pub fn resolve(&self, fingerprint: &Fingerprint, verdict: FlightVerdict) {
        if let Some((_, slot)) = self.slots.remove(fingerprint.as_str()) {
            *slot.verdict.lock() = Some(verdict);
            slot.notify.notify_waiters();
        }
    }

    /// Number of fingerprints with registered waiters
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
