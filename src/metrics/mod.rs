//! Reconcile statistics
//!
//! Counters are plain atomics so workers can update them without locking.
//! Permanent failures are also kept per key (last error wins) since they are
//! never retried and would otherwise vanish after the log line.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::service::ServiceKey;

/// A key that hit a non-retryable error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermanentFailure {
    pub key: ServiceKey,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub permanent_failures: u64,
    pub cache_errors: u64,
    pub timeouts: u64,
    pub in_flight: u32,
    pub failing_keys: Vec<PermanentFailure>,
}

/// Reconcile counters shared by every worker
#[derive(Debug, Default)]
pub struct ReconcileMetrics {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    permanent_failures: AtomicU64,
    cache_errors: AtomicU64,
    timeouts: AtomicU64,
    in_flight: AtomicU32,
    failing: DashMap<ServiceKey, PermanentFailure>,
}

impl ReconcileMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A worker picked up a key
    pub fn record_start(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// A worker released a key, whatever the outcome
    pub fn record_end(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    /// Successful sync; clears any earlier permanent failure for the key
    pub fn record_success(&self, key: &ServiceKey) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        self.failing.remove(key);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_permanent_failure(&self, key: &ServiceKey, reason: &str) {
        self.permanent_failures.fetch_add(1, Ordering::SeqCst);
        self.failing.insert(
            key.clone(),
            PermanentFailure {
                key: key.clone(),
                reason: reason.to_string(),
                at: Utc::now(),
            },
        );
    }

    pub fn record_cache_error(&self) {
        self.cache_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }

    pub fn failure(&self, key: &ServiceKey) -> Option<PermanentFailure> {
        self.failing.get(key).map(|r| r.clone())
    }

    pub fn snapshot(&self) -> ReconcileSnapshot {
        let mut failing_keys: Vec<PermanentFailure> =
            self.failing.iter().map(|r| r.clone()).collect();
        failing_keys.sort_by(|a, b| a.key.cmp(&b.key));

        ReconcileSnapshot {
            processed: self.processed.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            permanent_failures: self.permanent_failures.load(Ordering::SeqCst),
            cache_errors: self.cache_errors.load(Ordering::SeqCst),
            timeouts: self.timeouts.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            failing_keys,
        }
    }
}

/// Metrics shared across worker tasks
pub type SharedReconcileMetrics = Arc<ReconcileMetrics>;
