//! Deduplicating, delay-capable work queue.
//!
//! The queue tracks three sets of keys:
//! - `dirty`: keys that need processing (queued, or re-added while in flight)
//! - `processing`: keys handed out by [`WorkQueue::get`] and not yet `done`
//! - `waiting`: keys scheduled for a delayed add
//!
//! A key is never handed out twice concurrently. Adding a key that is in
//! flight only marks it dirty; it is queued again when `done` is called.
//!
//! Delays run on the Tokio clock, so tests can drive them with paused time.

use crate::backoff::{Backoff, ExponentialBackoff};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    /// Earliest pending delayed add per key, with the timer that owns it
    waiting: HashMap<K, (Instant, u64)>,
    /// Consecutive rate-limited requeues per key
    failures: HashMap<K, u32>,
    next_timer: u64,
    shutting_down: bool,
}

impl<K> Default for State<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: HashMap::new(),
            failures: HashMap::new(),
            next_timer: 0,
            shutting_down: false,
        }
    }
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    shutdown: CancellationToken,
    backoff: Box<dyn Backoff>,
}

/// Work queue handle. Clones share the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("waiting", &state.waiting.len())
            .field("shutting_down", &state.shutting_down)
            .field("backoff", &self.inner.backoff)
            .finish()
    }
}

// A poisoned lock only means another worker panicked mid-update; the sets
// stay structurally valid, so keep going with the inner value.
fn lock<K>(state: &Mutex<State<K>>) -> MutexGuard<'_, State<K>> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue retrying with [`ExponentialBackoff::default`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_backoff(ExponentialBackoff::default())
    }

    /// Create a queue with a custom retry policy.
    pub fn with_backoff(backoff: impl Backoff + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
                backoff: Box::new(backoff),
            }),
        }
    }

    /// Queue `key` for processing. Coalesced if it is already queued or in
    /// flight.
    pub fn add(&self, key: K) {
        let mut state = lock(&self.inner.state);
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Re-queued by done()
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The returned key is in flight until [`WorkQueue::done`] is called.
    pub async fn get(&self) -> Option<K> {
        loop {
            {
                let mut state = lock(&self.inner.state);
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            tokio::select! {
                () = self.inner.notify.notified() => {}
                () = self.inner.shutdown.cancelled() => {}
            }
        }
    }

    /// Mark `key` as processed. If it was re-added while in flight it is
    /// queued again.
    pub fn done(&self, key: &K) {
        let mut state = lock(&self.inner.state);
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed. Must be called within a Tokio
    /// runtime.
    ///
    /// If the key already has an earlier delayed add pending, this is a
    /// no-op; a later pending add is replaced by this one.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let ready_at = Instant::now() + delay;
        let timer = {
            let mut state = lock(&self.inner.state);
            if state.shutting_down {
                return;
            }
            if let Some((existing, _)) = state.waiting.get(&key) {
                if *existing <= ready_at {
                    return;
                }
            }
            let timer = state.next_timer;
            state.next_timer += 1;
            state.waiting.insert(key.clone(), (ready_at, timer));
            timer
        };

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(ready_at) => queue.fire(key, timer),
                () = queue.inner.shutdown.cancelled() => {}
            }
        });
    }

    fn fire(&self, key: K, timer: u64) {
        {
            let mut state = lock(&self.inner.state);
            match state.waiting.get(&key) {
                Some((_, owner)) if *owner == timer => {
                    state.waiting.remove(&key);
                }
                // Superseded by an earlier timer
                _ => return,
            }
        }
        self.add(key);
    }

    /// Add `key` after the backoff delay for its failure count, then count
    /// one more failure.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = lock(&self.inner.state);
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.backoff.delay_for(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &K) {
        lock(&self.inner.state).failures.remove(key);
    }

    /// Number of rate-limited requeues of `key` since it was last forgotten.
    #[must_use]
    pub fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.inner.state)
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Number of keys ready for delivery.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    /// Returns `true` if no key is ready for delivery.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the queue: pending and future [`WorkQueue::get`] calls return
    /// `None`, delayed adds are dropped.
    pub fn shut_down(&self) {
        {
            let mut state = lock(&self.inner.state);
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.inner.shutdown.cancel();
    }

    /// Returns `true` once [`WorkQueue::shut_down`] has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        lock(&self.inner.state).shutting_down
    }
}
