//! Meshsync queue: coalescing, rate-limited work queue.
//!
//! A key is pending at most once and in flight at most once. Adding a key
//! that is already pending is a no-op; adding a key that is being processed
//! parks it until the worker calls [`WorkQueue::done`], so any number of
//! re-adds during processing yield exactly one follow-up.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self { Self { base: Duration::from_millis(5), max: Duration::from_secs(1000) } }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max } }

    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

struct State<K> {
    queue: VecDeque<K>,
    /// Keys waiting to be handed out (queued, or parked behind an in-flight run).
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    failures: FxHashMap<K, u32>,
    shutting_down: bool,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff,
}

/// Cheap to clone; clones share one queue.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(backoff: Backoff) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    failures: FxHashMap::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> { self.shared.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Enqueue `key`. Returns false when it was already pending or the queue is shut down.
    pub fn add(&self, key: K) -> bool {
        let mut st = self.state();
        if st.shutting_down || st.dirty.contains(&key) {
            trace!(?key, "add coalesced");
            return false;
        }
        st.dirty.insert(key.clone());
        metrics::counter!("workqueue_adds_total", 1);
        if st.processing.contains(&key) {
            debug!(?key, "key in flight; deferred until done");
            return true;
        }
        st.queue.push_back(key);
        metrics::gauge!("workqueue_depth", st.queue.len() as f64);
        drop(st);
        self.shared.notify.notify_one();
        true
    }

    /// Enqueue `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let q = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(key);
        });
    }

    /// Record a failure for `key` and requeue it after its backoff delay.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = {
            let mut st = self.state();
            let n = st.failures.entry(key.clone()).or_insert(0);
            let delay = self.shared.backoff.delay(*n);
            *n = n.saturating_add(1);
            delay
        };
        metrics::counter!("workqueue_retries_total", 1);
        debug!(?key, delay_ms = %delay.as_millis(), "requeue with backoff");
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff for `key` after a successful run.
    pub fn forget(&self, key: &K) { self.state().failures.remove(key); }

    pub fn failures(&self, key: &K) -> u32 { self.state().failures.get(key).copied().unwrap_or(0) }

    /// Next key to process; `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut st = self.state();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    metrics::gauge!("workqueue_depth", st.queue.len() as f64);
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished; a re-add that arrived meanwhile is queued now.
    pub fn done(&self, key: &K) {
        let mut st = self.state();
        st.processing.remove(key);
        if st.dirty.contains(key) && !st.shutting_down {
            st.queue.push_back(key.clone());
            metrics::gauge!("workqueue_depth", st.queue.len() as f64);
            drop(st);
            self.shared.notify.notify_one();
        }
    }

    /// Keys ready to be handed out.
    pub fn len(&self) -> usize { self.state().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn in_flight(&self) -> usize { self.state().processing.len() }

    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.shared.notify.notify_waiters();
    }
}
