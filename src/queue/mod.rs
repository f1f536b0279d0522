//! Deduplicating, retry-aware work queue
//!
//! Producers (watch callbacks) `add` keys; consumers (reconciler workers)
//! `get` them, process, and report back with `done`. Every key moves through
//! an explicit state machine:
//!
//! ```text
//!            add                 get                  done
//!   Idle ─────────▶ Pending ─────────▶ Processing ─────────────▶ Idle
//!                     ▲                   │  add
//!                     │                   ▼
//!                     │  done      Processing(dirty)
//!                     └───────────────────┘
//!
//!   add_rate_limited: Idle ──▶ BackingOff ──(delay elapses)──▶ add
//! ```
//!
//! Guarantees:
//! - a key added many times while pending is handed out once
//! - a key is never handed to two consumers at the same time
//! - an add while processing is deferred, never dropped
//! - FIFO per key, no ordering between distinct keys

pub mod backoff;

use std::collections::{HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub use backoff::{BackoffConfig, ExponentialBackoff};

/// Where a key currently sits in the queue's state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Not known to the queue
    Idle,
    /// Waiting to be handed to a consumer
    Pending,
    /// Held by a consumer; `dirty` means it was re-added meanwhile
    Processing { dirty: bool },
    /// Waiting for its retry delay to elapse
    BackingOff,
}

#[derive(Debug)]
struct QueueState<K> {
    /// FIFO of keys ready to hand out
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while processing)
    dirty: HashSet<K>,
    /// Keys currently held by a consumer
    processing: HashSet<K>,
    /// Keys with a retry timer armed
    waiting: HashSet<K>,
    shutting_down: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: HashSet::new(),
            shutting_down: false,
        }
    }
}

struct Shared<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: ExponentialBackoff<K>,
    shutdown: CancellationToken,
}

/// Work queue of opaque keys, shared by cloning
///
/// Clones refer to the same queue, so the same instance can be handed to
/// every producer and consumer.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    /// Queue with the default backoff bounds
    pub fn new() -> Self {
        Self::with_backoff(ExponentialBackoff::default())
    }

    pub fn with_backoff(backoff: ExponentialBackoff<K>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                backoff,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` as needing processing
    ///
    /// No-op when the key is already pending; deferred until `done` when the
    /// key is being processed; ignored after shutdown.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down {
            trace!(key = %key, "Queue shutting down, dropping add");
            return;
        }
        if state.dirty.contains(&key) {
            trace!(key = %key, "Key already pending");
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            trace!(key = %key, "Key in flight, marked dirty");
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a shutdown wake-up can't slip by
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.shared.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Finish processing `key`; a key re-added meanwhile is queued again
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.shutting_down {
            return;
        }
        if state.dirty.contains(key) {
            trace!(key = %key, "Re-queueing dirty key");
            state.queue.push_back(key.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Add `key` again after its per-key backoff delay
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.shared.backoff.when(&key);
        self.add_after(key, delay);
    }

    /// Add `key` once `delay` has elapsed
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if !state.waiting.insert(key.clone()) {
                // A timer for this key is already armed
                return;
            }
        }

        debug!(key = %key, delay_ms = delay.as_millis() as u64, "Scheduling retry");

        let queue = self.clone();
        let cancel = self.shared.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    queue.lock().waiting.remove(&key);
                    queue.add(key);
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Clear retry history for `key`
    pub fn forget(&self, key: &K) {
        self.shared.backoff.forget(key);
    }

    /// Failures recorded for `key` since the last `forget`
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.shared.backoff.num_requeues(key)
    }

    /// Stop handing out keys, wake every waiter and drop armed retries
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
            state.waiting.clear();
        }
        self.shared.shutdown.cancel();
        self.shared.notify.notify_waiters();
        debug!("Work queue shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys ready to be handed out
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently held by consumers
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }

    pub fn state(&self, key: &K) -> KeyState {
        let state = self.lock();
        if state.processing.contains(key) {
            KeyState::Processing {
                dirty: state.dirty.contains(key),
            }
        } else if state.dirty.contains(key) {
            KeyState::Pending
        } else if state.waiting.contains(key) {
            KeyState::BackingOff
        } else {
            KeyState::Idle
        }
    }

    /// Backoff bounds this queue retries with
    pub fn backoff_bounds(&self) -> (Duration, Duration) {
        (self.shared.backoff.base(), self.shared.backoff.max())
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
