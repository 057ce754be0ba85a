//! kstatus queue: a deduplicating work queue drained by a pool of tokio workers.
//!
//! Keys are coalesced while queued, and a key that is re-added while it is being
//! processed is parked and requeued once the in-flight pass finishes. No key is
//! ever processed by two workers at once. Failed passes are retried with
//! exponential backoff up to `max_attempts`, after which the item is dropped.

#![forbid(unsafe_code)]

mod config;

pub use config::QueueConfig;

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Error returned by a reconciler.
pub trait ReconcileError: fmt::Display + Send + 'static {
    /// Permanent errors are reported once and never retried.
    fn is_permanent(&self) -> bool { false }
}

impl ReconcileError for anyhow::Error {}

/// Lifetime counters, mostly for tests and debug endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub processed: u64,
    pub retries: u64,
    pub dropped: u64,
    pub permanent_failures: u64,
}

struct State<K> {
    queue: VecDeque<K>,
    /// Keys waiting to be processed (queued, or parked behind an in-flight pass).
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    failures: FxHashMap<K, u32>,
    /// One pending delayed add per key, by deadline. A timer only fires if its deadline is still the one recorded.
    waiting: FxHashMap<K, tokio::time::Instant>,
    shutting_down: bool,
}

struct Shared<K> {
    cfg: QueueConfig,
    state: Mutex<State<K>>,
    notify: Notify,
    processed: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
    permanent: AtomicU64,
}

pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(cfg: QueueConfig) -> Self {
        let state = State {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            failures: FxHashMap::default(),
            waiting: FxHashMap::default(),
            shutting_down: false,
        };
        Self {
            shared: Arc::new(Shared {
                cfg,
                state: Mutex::new(state),
                notify: Notify::new(),
                processed: AtomicU64::new(0),
                retries: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                permanent: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig { &self.shared.cfg }
    fn name(&self) -> &str { &self.shared.cfg.name }

    /// Enqueue `key` unless it is already pending. Ignored after shutdown.
    pub fn add(&self, key: K) {
        let depth = {
            let mut st = self.lock();
            if st.shutting_down || st.dirty.contains(&key) {
                return;
            }
            st.dirty.insert(key.clone());
            if st.processing.contains(&key) {
                // Requeued by `done` once the in-flight pass returns.
                return;
            }
            st.queue.push_back(key);
            st.queue.len()
        };
        counter!("kstatus_queue_adds_total", 1u64, "queue" => self.name().to_string());
        gauge!("kstatus_queue_depth", depth as f64, "queue" => self.name().to_string());
        self.shared.notify.notify_one();
    }

    /// Enqueue `key` after `delay`. Must be called from within a tokio runtime.
    ///
    /// At most one delayed add is pending per key; the earliest deadline wins.
    /// A pending add is cancelled when the key is handed to a worker.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = tokio::time::Instant::now() + delay;
        {
            let mut st = self.lock();
            if st.shutting_down || st.waiting.get(&key).is_some_and(|at| *at <= deadline) {
                return;
            }
            st.waiting.insert(key.clone(), deadline);
        }
        let q = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let due = {
                let mut st = q.lock();
                if st.waiting.get(&key) == Some(&deadline) {
                    st.waiting.remove(&key);
                    true
                } else {
                    false
                }
            };
            if due {
                q.add(key);
            }
        });
    }

    /// Number of keys with a pending delayed add.
    pub fn waiting(&self) -> usize { self.lock().waiting.len() }

    /// Number of queued items, not counting in-flight ones.
    pub fn len(&self) -> usize { self.lock().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn is_shutdown(&self) -> bool { self.lock().shutting_down }

    /// Stop handing out items; in-flight passes run to completion.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            processed: self.shared.processed.load(Ordering::Relaxed),
            retries: self.shared.retries.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            permanent_failures: self.shared.permanent.load(Ordering::Relaxed),
        }
    }

    /// Drain the queue with `config().workers` workers until `stop` resolves,
    /// then wait for in-flight passes to finish. Reconcile errors never escape.
    pub async fn run<F, Fut, E, S>(&self, reconciler: F, stop: S)
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: ReconcileError,
        S: Future<Output = ()>,
    {
        let reconciler = Arc::new(reconciler);
        let workers = self.shared.cfg.workers.max(1);
        let mut set = JoinSet::new();
        for id in 0..workers {
            let q = self.clone();
            let r = Arc::clone(&reconciler);
            set.spawn(async move { q.worker(id, r).await });
        }
        info!(queue = %self.name(), workers, "queue started");

        stop.await;
        self.shutdown();
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!(queue = %self.name(), error = %e, "queue worker exited abnormally");
            }
        }
        info!(queue = %self.name(), "queue stopped");
    }

    async fn worker<F, Fut, E>(&self, id: usize, reconciler: Arc<F>)
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: ReconcileError,
    {
        while let Some(key) = self.next().await {
            let t0 = Instant::now();
            debug!(queue = %self.name(), worker = id, key = ?key, "processing item");
            // Run on its own task so a panicking reconciler fails the item, not the worker.
            match tokio::spawn(reconciler(key.clone())).await {
                Ok(res) => self.handle(&key, res),
                Err(e) => self.retry_or_drop(&key, &format!("reconciler panicked: {}", e)),
            }
            histogram!("kstatus_queue_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0, "queue" => self.name().to_string());
            self.done(&key);
        }
        debug!(queue = %self.name(), worker = id, "worker exiting");
    }

    async fn next(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking state so an add between the check and the await is not lost.
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    // This pass supersedes any retry still waiting for the key.
                    st.waiting.remove(&key);
                    st.processing.insert(key.clone());
                    gauge!("kstatus_queue_depth", st.queue.len() as f64, "queue" => self.name().to_string());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    fn done(&self, key: &K) {
        let requeued = {
            let mut st = self.lock();
            st.processing.remove(key);
            if st.dirty.contains(key) {
                st.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.shared.notify.notify_one();
        }
    }

    fn handle<E: ReconcileError>(&self, key: &K, res: Result<(), E>) {
        match res {
            Ok(()) => {
                self.lock().failures.remove(key);
                self.shared.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_permanent() => {
                self.lock().failures.remove(key);
                self.shared.permanent.fetch_add(1, Ordering::Relaxed);
                counter!("kstatus_queue_permanent_failures_total", 1u64, "queue" => self.name().to_string());
                error!(queue = %self.name(), key = ?key, error = %e, "permanent failure; item dropped without retry");
            }
            Err(e) => self.retry_or_drop(key, &e.to_string()),
        }
    }

    fn retry_or_drop(&self, key: &K, err: &str) {
        let max = self.shared.cfg.max_attempts;
        let attempt = {
            let mut st = self.lock();
            let n = st.failures.entry(key.clone()).or_insert(0);
            *n += 1;
            let attempt = *n;
            if attempt >= max {
                st.failures.remove(key);
            }
            attempt
        };
        if attempt >= max {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            counter!("kstatus_queue_dropped_total", 1u64, "queue" => self.name().to_string());
            error!(queue = %self.name(), key = ?key, attempt, max_attempts = max, error = %err, "giving up on item after max attempts");
            return;
        }
        let delay = self.shared.cfg.backoff(attempt);
        self.shared.retries.fetch_add(1, Ordering::Relaxed);
        counter!("kstatus_queue_retries_total", 1u64, "queue" => self.name().to_string());
        warn!(queue = %self.name(), key = ?key, attempt, max_attempts = max, delay_ms = delay.as_millis() as u64, error = %err, "reconcile failed; retrying");
        self.add_after(key.clone(), delay);
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_coalesces_pending_keys() {
        let q: WorkQueue<&'static str> = WorkQueue::new(QueueConfig::default());
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.next().await, Some("a"));
        // Re-adding an in-flight key parks it rather than queueing a second copy.
        q.add("a");
        assert_eq!(q.len(), 1);
        q.done(&"a");
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn delayed_adds_collapse_and_yield_to_a_dequeue() {
        let q: WorkQueue<&'static str> = WorkQueue::new(QueueConfig::default());
        q.add_after("a", Duration::from_millis(20));
        q.add_after("a", Duration::from_millis(40));
        assert_eq!(q.waiting(), 1);
        q.add("a");
        assert_eq!(q.next().await, Some("a"));
        assert_eq!(q.waiting(), 0);
        q.done(&"a");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_dequeue_and_ignores_adds() {
        let q: WorkQueue<u32> = WorkQueue::new(QueueConfig::default());
        q.add(1);
        q.shutdown();
        q.add(2);
        assert!(q.is_shutdown());
        assert_eq!(q.len(), 1);
        assert_eq!(q.next().await, None);
    }
}
