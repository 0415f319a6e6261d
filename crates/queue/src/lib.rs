//! Vigil work queue: converts a stream of change notifications into a
//! bounded set of "this key needs attention" tasks.
//!
//! The queue deduplicates pending keys, guarantees at most one worker
//! processes a given key at a time (keys re-added while in flight are
//! marked dirty and re-queued on completion), and schedules failing keys
//! for retry with capped per-key exponential backoff. Backoff sleeps run in
//! spawned tasks, so one failing key's delay never blocks unrelated keys.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::{debug, trace};
use vigil_core::ProjectKey;

/// Per-key retry backoff shape: `base * 2^(failures-1)`, clamped to `max`.
///
/// The defaults mirror the stock controller rate limiter: a few
/// milliseconds for the first retry, minutes at the ceiling.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base: Duration::from_millis(5), max: Duration::from_secs(1000) }
    }
}

#[derive(Default)]
struct Inner {
    /// FIFO of pending keys; `queued` is the authoritative membership set.
    order: VecDeque<ProjectKey>,
    queued: FxHashSet<ProjectKey>,
    /// Keys currently held by a worker.
    processing: FxHashSet<ProjectKey>,
    /// In-flight keys that were re-added and must requeue on `done`.
    dirty: FxHashSet<ProjectKey>,
    shutting_down: bool,
}

impl Inner {
    fn pop_next(&mut self) -> Option<ProjectKey> {
        while let Some(key) = self.order.pop_front() {
            if self.queued.remove(&key) {
                self.processing.insert(key.clone());
                return Some(key);
            }
        }
        None
    }
}

/// Deduplicating, rate-limiting FIFO of project keys.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    failures: Mutex<FxHashMap<ProjectKey, u32>>,
    backoff: BackoffConfig,
}

impl WorkQueue {
    pub fn new(backoff: BackoffConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            failures: Mutex::new(FxHashMap::default()),
            backoff,
        })
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("lock poisoned")
    }

    /// Enqueue a key unless it is already pending. A key currently being
    /// processed is marked dirty instead, guaranteeing the single-worker
    /// invariant while still re-running it afterwards. No-op once shut
    /// down.
    pub fn add(&self, key: ProjectKey) {
        {
            let mut inner = self.locked();
            if inner.shutting_down {
                return;
            }
            if inner.processing.contains(&key) {
                trace!(key = %key, "in flight; marking dirty");
                inner.dirty.insert(key);
                return;
            }
            if !inner.queued.insert(key.clone()) {
                return;
            }
            inner.order.push_back(key);
            counter!("queue_adds", 1u64);
            gauge!("queue_depth", inner.order.len() as f64);
        }
        self.notify.notify_waiters();
    }

    /// Pop the next pending key, waiting until one is available. `None`
    /// means the queue is shut down and fully drained: the caller should
    /// exit its loop.
    pub async fn get(&self) -> Option<ProjectKey> {
        loop {
            // Register for wakeups before re-checking state, so a
            // notify_waiters between the check and the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.locked();
                if let Some(key) = inner.pop_next() {
                    gauge!("queue_depth", inner.order.len() as f64);
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release the in-flight hold on `key`. Must be called exactly once per
    /// successful `get`, whatever the reconcile outcome; a dirty key is
    /// re-queued here.
    pub fn done(&self, key: &ProjectKey) {
        {
            let mut inner = self.locked();
            inner.processing.remove(key);
            if inner.dirty.remove(key) && !inner.shutting_down && inner.queued.insert(key.clone())
            {
                debug!(key = %key, "dirty key re-queued");
                inner.order.push_back(key.clone());
            }
        }
        self.notify.notify_waiters();
    }

    /// Clear the key's failure history. Call on success or permanent skip.
    pub fn forget(&self, key: &ProjectKey) {
        self.failures.lock().expect("lock poisoned").remove(key);
    }

    /// Schedule the key for re-add after its computed backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: ProjectKey) {
        if self.locked().shutting_down {
            return;
        }
        let failures = {
            let mut failures = self.failures.lock().expect("lock poisoned");
            let n = failures.entry(key.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let delay = self.delay_for(failures);
        counter!("queue_retries", 1u64);
        debug!(key = %key, failures, delay_ms = %delay.as_millis(), "requeue with backoff");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Backoff delay for the n-th consecutive failure. Non-decreasing in
    /// `failures` and clamped to the configured ceiling.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.backoff.base;
        }
        let exp = (failures - 1).min(31);
        self.backoff.base.saturating_mul(1u32 << exp).min(self.backoff.max)
    }

    /// Consecutive failure count recorded for the key.
    pub fn retries(&self, key: &ProjectKey) -> u32 {
        self.failures
            .lock()
            .expect("lock poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Stop accepting work. Parked and future `get` calls drain the
    /// remaining pending items once, then observe the shutdown.
    pub fn shut_down(&self) {
        {
            let mut inner = self.locked();
            inner.shutting_down = true;
            inner.dirty.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.locked().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(50);

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(BackoffConfig::default())
    }

    fn key(s: &str) -> ProjectKey {
        ProjectKey::from(s)
    }

    #[tokio::test]
    async fn add_deduplicates_pending_keys() {
        let q = queue();
        q.add(key("a"));
        q.add(key("a"));
        q.add(key("a"));

        assert_eq!(q.get().await, Some(key("a")));
        q.done(&key("a"));

        // nothing left: the duplicates collapsed into one entry
        assert!(timeout(TICK, q.get()).await.is_err());
    }

    #[tokio::test]
    async fn in_flight_key_is_never_handed_out_twice() {
        let q = queue();
        q.add(key("a"));
        let got = q.get().await.expect("first get");

        // re-added while processing: must not become available yet
        q.add(key("a"));
        assert!(timeout(TICK, q.get()).await.is_err());

        // completion releases the dirty re-add
        q.done(&got);
        assert_eq!(q.get().await, Some(key("a")));
        q.done(&key("a"));
    }

    #[tokio::test]
    async fn clean_done_does_not_requeue() {
        let q = queue();
        q.add(key("a"));
        let got = q.get().await.expect("get");
        q.done(&got);
        assert!(timeout(TICK, q.get()).await.is_err());
    }

    #[tokio::test]
    async fn unrelated_keys_interleave() {
        let q = queue();
        q.add(key("a"));
        q.add(key("b"));
        let first = q.get().await.expect("a");
        let second = q.get().await.expect("b");
        assert_ne!(first, second);
        q.done(&first);
        q.done(&second);
    }

    #[tokio::test]
    async fn shutdown_drains_then_signals() {
        let q = queue();
        q.add(key("a"));
        q.add(key("b"));
        q.shut_down();

        // remaining items drain first
        assert!(q.get().await.is_some());
        assert!(q.get().await.is_some());
        // then the shutdown signal, promptly and forever
        assert_eq!(timeout(Duration::from_secs(1), q.get()).await.expect("blocked"), None);
        assert_eq!(timeout(Duration::from_secs(1), q.get()).await.expect("blocked"), None);

        // post-shutdown adds are no-ops
        q.add(key("c"));
        assert_eq!(timeout(Duration::from_secs(1), q.get()).await.expect("blocked"), None);
    }

    #[tokio::test]
    async fn parked_getter_unblocks_on_shutdown() {
        let q = queue();
        let waiter = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.get().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shut_down();
        let got = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("getter stayed parked")
            .expect("join");
        assert_eq!(got, None);
    }

    #[test]
    fn backoff_sequence_is_nondecreasing_and_capped() {
        let q = WorkQueue::new(BackoffConfig {
            base: Duration::from_millis(5),
            max: Duration::from_millis(80),
        });
        let delays: Vec<_> = (1..=8).map(|n| q.delay_for(n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "delays must not decrease: {delays:?}");
        }
        assert_eq!(delays[0], Duration::from_millis(5));
        assert_eq!(delays[1], Duration::from_millis(10));
        assert_eq!(*delays.last().expect("nonempty"), Duration::from_millis(80));
        // absurd failure counts saturate instead of overflowing
        assert_eq!(q.delay_for(u32::MAX), Duration::from_millis(80));
    }

    #[tokio::test]
    async fn forget_resets_the_failure_count() {
        let q = WorkQueue::new(BackoffConfig {
            base: Duration::from_millis(1),
            max: Duration::from_millis(50),
        });
        q.add_rate_limited(key("a"));
        q.add_rate_limited(key("a"));
        q.add_rate_limited(key("a"));
        assert_eq!(q.retries(&key("a")), 3);

        q.forget(&key("a"));
        assert_eq!(q.retries(&key("a")), 0);
    }

    #[tokio::test]
    async fn rate_limited_key_comes_back_after_the_delay() {
        let q = WorkQueue::new(BackoffConfig {
            base: Duration::from_millis(10),
            max: Duration::from_millis(100),
        });
        let t0 = Instant::now();
        q.add_rate_limited(key("a"));
        let got = timeout(Duration::from_secs(5), q.get())
            .await
            .expect("requeue never arrived");
        assert_eq!(got, Some(key("a")));
        assert!(t0.elapsed() >= Duration::from_millis(10));
        q.done(&key("a"));
    }

    #[tokio::test]
    async fn one_keys_backoff_does_not_block_others() {
        let q = WorkQueue::new(BackoffConfig {
            base: Duration::from_secs(60),
            max: Duration::from_secs(60),
        });
        q.add_rate_limited(key("slow"));
        q.add(key("fast"));
        // the fast key is available immediately despite the slow key's delay
        let got = timeout(Duration::from_secs(1), q.get())
            .await
            .expect("fast key starved by unrelated backoff");
        assert_eq!(got, Some(key("fast")));
        q.done(&key("fast"));
    }
}
