use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

/// Dispatches per key before it is declared a permanent failure.
pub const RETRY_CAP: u8 = 3;

#[derive(Debug, Default)]
struct RegistryState {
    /// Keys currently eligible for dispatch, FIFO.
    not_assigned: VecDeque<String>,
    /// Keys with a recorded result.
    finished: HashSet<String>,
    /// Keys whose last allowed dispatch also timed out.
    exhausted: HashSet<String>,
    /// Dispatch count per key; defined for every key, never decreasing.
    attempts: HashMap<String, u8>,
}

impl RegistryState {
    fn is_done(&self, total: usize) -> bool {
        self.finished.len() + self.exhausted.len() >= total
    }
}

/// The coupled assignment collections under one lock, plus the completion
/// signal.
///
/// A key is always in exactly one of three states: pending (in
/// `not_assigned`), in flight (in no collection), or terminal (in
/// `finished` or `exhausted`). The completion notifier is only ever
/// touched after the assignment lock is released.
#[derive(Debug)]
pub struct AssignmentRegistry {
    state: Mutex<RegistryState>,
    /// Snapshot of the pending count at construction; immutable afterwards.
    total: usize,
    done_notify: Notify,
}

impl AssignmentRegistry {
    /// Build the registry already populated, so the termination predicate
    /// is correct before any service loop starts.
    pub fn new(keys: Vec<String>) -> Self {
        let attempts = keys.iter().map(|k| (k.clone(), 0)).collect();
        let total = keys.len();
        Self {
            state: Mutex::new(RegistryState {
                not_assigned: keys.into(),
                finished: HashSet::new(),
                exhausted: HashSet::new(),
                attempts,
            }),
            total,
            done_notify: Notify::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Take the next pending key. Returns `None` when the queue is empty,
    /// or when the head key turned out to have no dispatches left (the key
    /// moves to `exhausted` and, if that completes the run, completion is
    /// signalled).
    pub fn pop_next(&self) -> Option<String> {
        let mut state = self.lock();
        let key = state.not_assigned.pop_front()?;
        if state.attempts.get(&key).copied().unwrap_or(0) >= RETRY_CAP {
            tracing::debug!(key = %key, "Dropping exhausted key from dispatch queue");
            state.exhausted.insert(key);
            self.release_and_signal(state);
            return None;
        }
        Some(key)
    }

    /// Record one dispatch of `key`. Called immediately after a successful
    /// `pop_next`, which guarantees the count stays at or below the cap.
    pub fn mark_assigned(&self, key: &str) {
        let mut state = self.lock();
        let attempts = state.attempts.entry(key.to_string()).or_insert(0);
        *attempts = attempts.saturating_add(1);
    }

    /// The commander's deadline for a dispatch expired. Re-queues the key
    /// unless a result already arrived, or moves it to `exhausted` when it
    /// just burned its last dispatch. Returns true when the dispatch
    /// failed (the caller fires its failure callback).
    pub fn on_timeout(&self, key: &str) -> bool {
        let mut state = self.lock();
        if state.finished.contains(key) {
            return false;
        }
        if state.attempts.get(key).copied().unwrap_or(0) >= RETRY_CAP {
            state.not_assigned.retain(|k| k != key);
            state.exhausted.insert(key.to_string());
        } else if !state.not_assigned.iter().any(|k| k == key) {
            state.not_assigned.push_back(key.to_string());
        }
        self.release_and_signal(state);
        true
    }

    /// A result arrived for `key`. Idempotent; repeat calls do not
    /// double-count toward completion. Last successful result wins, even
    /// against an earlier declaration of exhaustion.
    pub fn on_result(&self, key: &str) {
        let mut state = self.lock();
        state.not_assigned.retain(|k| k != key);
        state.exhausted.remove(key);
        state.finished.insert(key.to_string());
        self.release_and_signal(state);
    }

    pub fn done(&self) -> bool {
        self.lock().is_done(self.total)
    }

    /// How many dispatches `key` has received so far.
    pub fn attempts(&self, key: &str) -> u8 {
        self.lock().attempts.get(key).copied().unwrap_or(0)
    }

    /// Park until every key is terminal. The predicate is monotone, so a
    /// single wakeup after it turns true suffices.
    pub async fn wait_for_done(&self) {
        loop {
            let notified = self.done_notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before re-checking, so a signal landing
            // between the check and the await is not lost.
            notified.as_mut().enable();
            if self.done() {
                return;
            }
            notified.await;
        }
    }

    /// Wake any `wait_for_done` callers regardless of state; used on
    /// shutdown.
    pub fn wake_waiters(&self) {
        self.done_notify.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // The lock is only held for map operations; poisoning would mean a
        // panic inside one of those, which is unrecoverable anyway.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Evaluate the predicate under the lock, release, then signal.
    fn release_and_signal(&self, state: MutexGuard<'_, RegistryState>) {
        let now_done = state.is_done(self.total);
        drop(state);
        if now_done {
            self.done_notify.notify_waiters();
        }
    }
}
