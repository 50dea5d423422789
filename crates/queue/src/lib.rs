//! ixo queue: the work queue between event sources and reconcile workers.
//!
//! Keys are coalesced (a pending key is never duplicated), a key handed out by
//! [`WorkQueue::get`] is in flight until [`WorkQueue::done`], and a key re-added
//! while in flight is marked dirty and re-queued on `done`. Delayed adds run on
//! Tokio's monotonic clock.

#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Anything usable as a queue key.
pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> QueueKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Per-key exponential failure backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_millis(5), max: Duration::from_secs(1000) }
    }
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).map_or(self.max, |d| d.min(self.max))
    }
}

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need processing: queued, or re-added while in flight.
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    failures: FxHashMap<K, u32>,
    shutting_down: bool,
}

enum Next<K> {
    Item(K),
    Empty,
    Shutdown,
}

struct Delayed<K> {
    key: K,
    ready_at: Instant,
}

pub struct WorkQueue<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    delay_tx: mpsc::UnboundedSender<Delayed<K>>,
    backoff: Backoff,
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create a queue and spawn its delay loop. Must be called within a Tokio runtime.
    pub fn new(name: impl Into<String>, backoff: Backoff) -> Arc<Self> {
        let (delay_tx, delay_rx) = mpsc::unbounded_channel();
        let q = Arc::new(Self {
            name: name.into(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                failures: FxHashMap::default(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            delay_tx,
            backoff,
        });
        tokio::spawn(waiting_loop(Arc::downgrade(&q), delay_rx));
        q
    }

    pub fn name(&self) -> &str { &self.name }

    // Every critical section leaves the state consistent, so a poisoned lock is safe to reuse.
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` as needing processing. Idempotent while the key is pending.
    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(&key) {
            return;
        }
        counter!("workqueue_adds_total", 1u64, "queue" => self.name.clone());
        st.dirty.insert(key.clone());
        if st.processing.contains(&key) {
            trace!(queue = %self.name, key = ?key, "key in flight; marked dirty");
            return;
        }
        st.queue.push_back(key);
        gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.name.clone());
        drop(st);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed. Of several pending delays for one key the earliest wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let now = Instant::now();
        let ready_at = now.checked_add(delay).unwrap_or_else(|| now + Duration::from_secs(86_400 * 365));
        if self.delay_tx.send(Delayed { key, ready_at }).is_err() {
            debug!(queue = %self.name, "delay loop gone; dropping delayed add");
        }
    }

    /// Add after the key's current backoff and bump its failure count.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut st = self.lock();
            let n = st.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay(*n);
            *n = n.saturating_add(1);
            delay
        };
        counter!("workqueue_retries_total", 1u64, "queue" => self.name.clone());
        self.add_after(key, delay);
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Failures recorded for `key` since the last [`forget`](Self::forget).
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    fn try_next(&self) -> Next<K> {
        let mut st = self.lock();
        if st.shutting_down {
            return Next::Shutdown;
        }
        match st.queue.pop_front() {
            Some(key) => {
                st.dirty.remove(&key);
                st.processing.insert(key.clone());
                let more = !st.queue.is_empty();
                gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.name.clone());
                drop(st);
                // Notify stores a single permit; pass the wakeup on while work remains.
                if more {
                    self.notify.notify_one();
                }
                Next::Item(key)
            }
            None => Next::Empty,
        }
    }

    /// Wait for the next key and mark it in flight. `None` once the queue is shut down.
    ///
    /// No two callers ever hold the same key at the same time.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_next() {
                Next::Item(key) => return Some(key),
                Next::Shutdown => return None,
                Next::Empty => notified.await,
            }
        }
    }

    /// Finish processing `key`; re-queues it if it was added while in flight.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.shutting_down || !st.dirty.contains(key) {
            return;
        }
        st.queue.push_back(key.clone());
        gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.name.clone());
        drop(st);
        self.notify.notify_one();
    }

    /// Stop handing out keys. Blocked and future `get` calls return `None`.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        debug!(queue = %self.name, "work queue shutting down");
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Keys ready to be handed out.
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_processing(&self, key: &K) -> bool { self.lock().processing.contains(key) }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Holds delayed keys until due, then adds them. Exits when the queue is dropped or shut down.
async fn waiting_loop<K: QueueKey>(queue: Weak<WorkQueue<K>>, mut rx: mpsc::UnboundedReceiver<Delayed<K>>) {
    let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut entries: FxHashMap<u64, K> = FxHashMap::default();
    let mut waiting: FxHashMap<K, (Instant, u64)> = FxHashMap::default();
    let mut seq: u64 = 0;
    loop {
        let next = heap.peek().map(|Reverse((at, _))| *at);
        tokio::select! {
            maybe = rx.recv() => {
                let Some(d) = maybe else { break };
                if let Some((at, _)) = waiting.get(&d.key) {
                    if *at <= d.ready_at {
                        continue;
                    }
                }
                seq = seq.wrapping_add(1);
                // An older, later entry for the same key stays in the heap but no longer resolves.
                if let Some((_, old)) = waiting.insert(d.key.clone(), (d.ready_at, seq)) {
                    entries.remove(&old);
                }
                entries.insert(seq, d.key);
                heap.push(Reverse((d.ready_at, seq)));
            }
            _ = sleep_until_opt(next) => {
                let Some(q) = queue.upgrade() else { break };
                if q.is_shutting_down() {
                    break;
                }
                let now = Instant::now();
                while let Some(Reverse((at, id))) = heap.peek().copied() {
                    if at > now {
                        break;
                    }
                    heap.pop();
                    if let Some(key) = entries.remove(&id) {
                        waiting.remove(&key);
                        q.add(key);
                    }
                }
            }
        }
    }
    debug!("delay loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let b = Backoff { base: Duration::from_millis(5), max: Duration::from_secs(1) };
        assert_eq!(b.delay(0), Duration::from_millis(5));
        assert_eq!(b.delay(1), Duration::from_millis(10));
        assert_eq!(b.delay(3), Duration::from_millis(40));
        assert_eq!(b.delay(10), Duration::from_secs(1));
        assert_eq!(b.delay(200), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn pending_keys_coalesce() {
        let q = WorkQueue::new("t", Backoff::default());
        q.add("a");
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn dirty_during_processing_requeues_once_on_done() {
        let q = WorkQueue::new("t", Backoff::default());
        q.add("a");
        let k = q.get().await.unwrap();
        assert!(q.is_processing(&"a"));
        q.add("a");
        q.add("a");
        // In flight: not handed out again until done.
        assert!(q.is_empty());
        q.done(&k);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn done_without_readd_drops_key() {
        let q = WorkQueue::new("t", Backoff::default());
        q.add(1u32);
        let k = q.get().await.unwrap();
        q.done(&k);
        assert!(q.is_empty());
        assert!(!q.is_processing(&1));
    }

    #[tokio::test]
    async fn rate_limited_counts_until_forget() {
        let q = WorkQueue::new("t", Backoff::default());
        q.add_rate_limited("a");
        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 2);
        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let q = WorkQueue::<&'static str>::new("t", Backoff::default());
        let q2 = Arc::clone(&q);
        let h = tokio::spawn(async move { q2.get().await });
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(h.await.unwrap(), None);
        q.add("late");
        assert!(q.is_empty());
    }
}
