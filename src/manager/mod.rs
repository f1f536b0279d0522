//! Service reconciler
//!
//! The manager turns watch callbacks into queue keys and runs the workers
//! that drain the queue. For every key a worker:
//! 1. resolves the desired state from the object cache (absent = delete)
//! 2. hands it to the announcer, bounded by the sync timeout
//! 3. reports back to the queue: forget on success or permanent error,
//!    rate-limited requeue on a retryable error
//!
//! The manager keeps no state of its own between attempts; everything is
//! rebuilt from the cache each time, which is what makes re-delivery after
//! dedup or retry safe.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bgp::{Announcer, PeerStatus, SessionError, SessionSource, SyncOutcome};
use crate::config::ManagerConfig;
use crate::metrics::{ReconcileMetrics, SharedReconcileMetrics};
use crate::queue::{ExponentialBackoff, WorkQueue};
use crate::service::{
    CacheError, DesiredState, EndpointSource, KeyError, NoEndpoints, ObjectCache, Service,
    ServiceKey,
};

/// Errors surfaced to watch callbacks and status callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("Invalid service key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Reconcile loop settings
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Upper bound for a single announcer call
    pub sync_timeout: Duration,
    /// Retries before a key is given up on; 0 retries forever
    pub max_retries: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(10),
            max_retries: 0,
        }
    }
}

impl From<&ManagerConfig> for ReconcilerConfig {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            sync_timeout: config.sync_timeout(),
            max_retries: config.max_retries,
        }
    }
}

/// Reconciles load-balancer services against the announcer
pub struct Manager {
    queue: WorkQueue<ServiceKey>,
    cache: Arc<dyn ObjectCache>,
    endpoints: Arc<dyn EndpointSource>,
    announcer: Arc<dyn Announcer>,
    sessions: Arc<dyn SessionSource>,
    metrics: SharedReconcileMetrics,
    config: ReconcilerConfig,
}

impl Manager {
    /// Manager with a default queue and no endpoint data source
    pub fn new(
        cache: Arc<dyn ObjectCache>,
        announcer: Arc<dyn Announcer>,
        sessions: Arc<dyn SessionSource>,
    ) -> Self {
        Self {
            queue: WorkQueue::new(),
            cache,
            endpoints: Arc::new(NoEndpoints),
            announcer,
            sessions,
            metrics: Arc::new(ReconcileMetrics::new()),
            config: ReconcilerConfig::default(),
        }
    }

    /// Apply settings from the config file, including the queue's backoff
    pub fn from_config(
        config: &ManagerConfig,
        cache: Arc<dyn ObjectCache>,
        announcer: Arc<dyn Announcer>,
        sessions: Arc<dyn SessionSource>,
    ) -> Self {
        Self::new(cache, announcer, sessions)
            .with_queue(WorkQueue::with_backoff(ExponentialBackoff::from_config(
                &config.backoff,
            )))
            .with_config(ReconcilerConfig::from(config))
    }

    pub fn with_endpoints(mut self, endpoints: Arc<dyn EndpointSource>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_queue(mut self, queue: WorkQueue<ServiceKey>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn queue(&self) -> &WorkQueue<ServiceKey> {
        &self.queue
    }

    pub fn metrics(&self) -> &SharedReconcileMetrics {
        &self.metrics
    }

    // =========================================================================
    // Watch ingestion
    // =========================================================================

    pub fn on_add_service(&self, service: &Service) -> Result<(), ManagerError> {
        let key = service.key()?;
        debug!(key = %key, "Service added");
        self.queue.add(key);
        Ok(())
    }

    pub fn on_update_service(&self, old: &Service, new: &Service) -> Result<(), ManagerError> {
        let new_key = new.key()?;
        let old_key = old.key()?;
        debug!(key = %new_key, "Service updated");
        if old_key != new_key {
            // Keys are stable for a service's lifetime; if the watch layer
            // ever reports otherwise the old key still needs its withdrawal
            warn!(old = %old_key, new = %new_key, "Service key changed on update");
            self.queue.add(old_key);
        }
        self.queue.add(new_key);
        Ok(())
    }

    pub fn on_delete_service(&self, service: &Service) -> Result<(), ManagerError> {
        let key = service.key()?;
        debug!(key = %key, "Service deleted");
        self.queue.add(key);
        Ok(())
    }

    /// Endpoint data for `key` moved; reconcile it again
    pub fn on_endpoints_changed(&self, key: &ServiceKey) {
        debug!(key = %key, "Endpoints changed");
        self.queue.add(key.clone());
    }

    /// Enqueue every given key, e.g. after a peer session came up or went down
    pub fn resync(&self, keys: impl IntoIterator<Item = ServiceKey>) -> usize {
        let mut count = 0;
        for key in keys {
            self.queue.add(key);
            count += 1;
        }
        if count > 0 {
            info!(services = count, "Resyncing services");
        }
        count
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn get_peer_statuses(&self) -> Result<Vec<PeerStatus>, ManagerError> {
        Ok(self.sessions.get_peer_statuses()?)
    }

    // =========================================================================
    // Reconcile loop
    // =========================================================================

    /// Desired state for `key` as of now
    pub fn resolve_desired(&self, key: &ServiceKey) -> Result<DesiredState, CacheError> {
        match self.cache.get_by_key(key)? {
            Some(service) => {
                let endpoints = self.endpoints.resolve(key);
                Ok(DesiredState::present(key.clone(), service, endpoints))
            }
            None => Ok(DesiredState::absent(key.clone())),
        }
    }

    /// Take one key from the queue and process it
    ///
    /// Returns `false` once the queue is shut down.
    pub async fn process_next_item(&self) -> bool {
        self.process_next_item_until(&CancellationToken::new()).await
    }

    async fn process_next_item_until(&self, cancel: &CancellationToken) -> bool {
        let key = tokio::select! {
            key = self.queue.get() => key,
            _ = cancel.cancelled() => None,
        };
        match key {
            Some(key) => {
                self.process_key(key, cancel).await;
                true
            }
            None => false,
        }
    }

    /// Worker loop: runs until the queue shuts down or `cancel` fires
    pub async fn run_worker(&self, cancel: CancellationToken) {
        while self.process_next_item_until(&cancel).await {}
    }

    /// Single worker running until the queue shuts down
    pub async fn run(&self) {
        self.run_worker(CancellationToken::new()).await;
    }

    async fn process_key(&self, key: ServiceKey, cancel: &CancellationToken) {
        self.metrics.record_start();

        let outcome = match self.resolve_desired(&key) {
            Ok(desired) => self.apply_bounded(&desired, cancel).await,
            Err(e) => {
                self.metrics.record_cache_error();
                SyncOutcome::retryable(format!("cache lookup failed: {}", e))
            }
        };

        // The key is always released, whatever happened above
        self.queue.done(&key);
        self.handle_outcome(&key, outcome);

        self.metrics.record_end();
    }

    async fn apply_bounded(
        &self,
        desired: &DesiredState,
        cancel: &CancellationToken,
    ) -> SyncOutcome {
        debug!(
            key = %desired.key,
            deletion = desired.is_deletion(),
            endpoints = desired.endpoints.len(),
            "Applying desired state"
        );

        // A panicking announcer must not skip `done` and wedge the key
        let attempt = AssertUnwindSafe(self.announcer.apply(desired)).catch_unwind();

        tokio::select! {
            result = timeout(self.config.sync_timeout, attempt) => {
                match result {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => {
                        error!(key = %desired.key, "Announcer panicked during sync");
                        SyncOutcome::retryable("announcer panicked")
                    }
                    Err(_) => {
                        self.metrics.record_timeout();
                        SyncOutcome::retryable(format!(
                            "announcer did not finish within {:?}",
                            self.config.sync_timeout
                        ))
                    }
                }
            }
            _ = cancel.cancelled() => SyncOutcome::retryable("worker cancelled mid-sync"),
        }
    }

    fn handle_outcome(&self, key: &ServiceKey, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Success => {
                self.queue.forget(key);
                self.metrics.record_success(key);
                debug!(key = %key, "Service synced");
            }
            SyncOutcome::PermanentError(reason) => {
                self.queue.forget(key);
                self.metrics.record_permanent_failure(key, &reason);
                error!(key = %key, %reason, "Service sync failed permanently");
            }
            SyncOutcome::RetryableError(reason) => {
                let attempts = self.queue.num_requeues(key);
                if self.config.max_retries > 0 && attempts >= self.config.max_retries {
                    self.queue.forget(key);
                    let reason = format!("gave up after {} retries: {}", attempts, reason);
                    self.metrics.record_permanent_failure(key, &reason);
                    error!(key = %key, %reason, "Dropping service from queue");
                    return;
                }
                self.metrics.record_retry();
                warn!(key = %key, attempt = attempts + 1, %reason, "Service sync failed, retrying");
                self.queue.add_rate_limited(key.clone());
            }
        }
    }
}

/// Running reconcile workers
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    queue: WorkQueue<ServiceKey>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop taking new keys; keys in flight finish first
    pub async fn shutdown(self) {
        self.queue.shut_down();
        join_all(self.handles).await;
        info!("Reconcile workers stopped");
    }

    /// Abort in-flight syncs; their keys are released as retryable
    pub async fn cancel(self) {
        self.cancel.cancel();
        self.queue.shut_down();
        join_all(self.handles).await;
        info!("Reconcile workers cancelled");
    }
}

/// Spawn `workers` reconcile loops sharing the manager's queue
pub fn spawn_workers(manager: Arc<Manager>, workers: usize) -> WorkerPool {
    let cancel = CancellationToken::new();
    let workers = workers.max(1);

    info!(workers, "Starting reconcile workers");

    let handles = (0..workers)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.run_worker(cancel).await })
        })
        .collect();

    WorkerPool {
        handles,
        queue: manager.queue.clone(),
        cancel,
    }
}
