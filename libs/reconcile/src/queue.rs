//! Set-keyed work queue with coalescing and in-flight tracking.
//!
//! A key is pending at most once: either ready, or scheduled for later.
//! Adding a pending key is a no-op (a scheduled key is pulled forward).
//! A key handed to a worker is marked in flight; adds arriving meanwhile
//! are deferred and released by [`WorkQueue::done`], so no key is ever
//! processed by two workers at once.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::backoff::BackoffPolicy;

struct State<K> {
    /// Keys ready for a worker, in arrival order.
    ready: VecDeque<K>,

    /// Membership set for `ready`.
    queued: HashSet<K>,

    /// Keys scheduled for a later time.
    delayed: HashMap<K, Instant>,

    /// Keys currently held by a worker.
    in_flight: HashSet<K>,

    /// Adds that arrived while the key was in flight. `None` means "as soon
    /// as it is done".
    deferred: HashMap<K, Option<Instant>>,

    /// Consecutive failures per key, for backoff.
    failures: HashMap<K, u32>,

    shut_down: bool,
}

/// Multi-producer, multi-consumer coalescing queue.
pub struct WorkQueue<K> {
    backoff: BackoffPolicy,
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            backoff,
            state: Mutex::new(State {
                ready: VecDeque::new(),
                queued: HashSet::new(),
                delayed: HashMap::new(),
                in_flight: HashSet::new(),
                deferred: HashMap::new(),
                failures: HashMap::new(),
                shut_down: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // A poisoned queue is still structurally valid.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue `key` for immediate processing.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        if state.in_flight.contains(&key) {
            state.deferred.insert(key, None);
            return;
        }
        if state.queued.contains(&key) {
            return;
        }
        state.delayed.remove(&key);
        state.queued.insert(key.clone());
        state.ready.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueue `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let at = Instant::now() + delay;
        let mut state = self.lock();
        if state.shut_down || state.queued.contains(&key) {
            return;
        }
        if state.in_flight.contains(&key) {
            match state.deferred.entry(key) {
                Entry::Occupied(mut entry) => {
                    if let Some(existing) = entry.get() {
                        if at < *existing {
                            entry.insert(Some(at));
                        }
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(Some(at));
                }
            }
            return;
        }
        let slot = state.delayed.entry(key).or_insert(at);
        if at < *slot {
            *slot = at;
        }
        drop(state);
        // Sleeping workers recompute their deadline.
        self.notify.notify_one();
    }

    /// Enqueue `key` after its next backoff delay, or after `hint` when the
    /// server suggested one. Returns the delay used.
    pub fn add_rate_limited(&self, key: K, hint: Option<Duration>) -> Duration {
        let attempt = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let attempt = *failures;
            *failures = failures.saturating_add(1);
            attempt
        };
        let delay = hint.unwrap_or_else(|| self.backoff.delay(attempt));
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for `key`.
    pub fn failures(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Take the next ready key without waiting.
    pub fn try_next(&self) -> Option<K> {
        let mut state = self.lock();
        Self::pop(&mut state, Instant::now())
    }

    /// Wait for the next ready key. Returns `None` once shut down.
    ///
    /// Cancel-safe: a key is only removed in the poll that returns it.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                if let Some(key) = Self::pop(&mut state, Instant::now()) {
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
                state.delayed.values().min().copied()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn pop(state: &mut State<K>, now: Instant) -> Option<K> {
        let due: Vec<K> = state
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            state.delayed.remove(&key);
            if state.queued.insert(key.clone()) {
                state.ready.push_back(key);
            }
        }

        let key = state.ready.pop_front()?;
        state.queued.remove(&key);
        state.in_flight.insert(key.clone());
        Some(key)
    }

    /// Release `key` after processing; deferred adds are applied now.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.in_flight.remove(key);
        let Some(deferred) = state.deferred.remove(key) else {
            return;
        };
        if state.shut_down {
            return;
        }
        match deferred {
            None => {
                state.delayed.remove(key);
                if state.queued.insert(key.clone()) {
                    state.ready.push_back(key.clone());
                }
            }
            Some(at) => {
                let slot = state.delayed.entry(key.clone()).or_insert(at);
                if at < *slot {
                    *slot = at;
                }
            }
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Stop handing out keys; waiting workers return `None`.
    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.notify.notify_waiters();
    }

    /// Number of pending keys (ready or scheduled).
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is currently held by a worker.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.lock().in_flight.contains(key)
    }
}
