//! Deduplicating, rate-limited work queue.
//!
//! The queue holds keys, not objects. It guarantees:
//! - a key is pending at most once (bursts of adds coalesce),
//! - a key handed out by [`WorkQueue::get`] is not handed out again until
//!   [`WorkQueue::done`] is called for it; adds that arrive in the meantime
//!   mark it dirty and re-queue it on `done`,
//! - after [`WorkQueue::shut_down`] every `get` returns `None`.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::backoff::{BackoffPolicy, RateLimiter};

/// Shared handle to a work queue. Cloning is cheap.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

struct Shared<K> {
    name: String,
    state: Mutex<State<K>>,
    limiter: Mutex<RateLimiter<K>>,
    notify: Notify,
}

struct State<K> {
    /// Pending keys in FIFO order.
    queue: VecDeque<K>,

    /// Keys that need processing (pending, or re-added while in flight).
    dirty: HashSet<K>,

    /// Keys currently held by a worker.
    processing: HashSet<K>,

    shutting_down: bool,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    /// Create a new queue whose retries follow `policy`.
    pub fn new(name: impl Into<String>, policy: BackoffPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                limiter: Mutex::new(RateLimiter::new(policy)),
                notify: Notify::new(),
            }),
        }
    }

    /// Queue name, used in logs.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// A handle that can only add keys, for handing to event sources.
    pub fn enqueuer(&self) -> Enqueuer<K> {
        Enqueuer {
            queue: self.clone(),
        }
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(key.clone()) {
            trace!(queue = %self.shared.name, ?key, "Key already pending");
            return;
        }
        if state.processing.contains(&key) {
            // Re-queued by `done`.
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add `key` after its per-key backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter().when(&key);
        debug!(
            queue = %self.shared.name,
            ?key,
            delay_ms = delay.as_millis() as u64,
            "Requeueing key with backoff"
        );
        self.add_after(key, delay);
    }

    /// Reset the backoff state of `key`.
    pub fn forget(&self, key: &K) {
        self.limiter().forget(key);
    }

    /// How many times `key` has been rate-limited since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter().num_requeues(key)
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add or
            // shutdown cannot slip between the check and the wait.
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on; another idle worker may take the next key.
                        self.shared.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as finished. Re-queues it if it was added while in flight.
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Stop handing out keys and discard pending ones.
    pub fn shut_down(&self) {
        let mut state = self.state();
        state.shutting_down = true;
        let discarded = state.queue.len();
        state.queue.clear();
        state.dirty.clear();
        drop(state);

        debug!(queue = %self.shared.name, discarded, "Work queue shut down");
        self.shared.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of pending keys (excluding in-flight ones).
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Whether no keys are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn limiter(&self) -> MutexGuard<'_, RateLimiter<K>> {
        self.shared
            .limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Add-only capability over a [`WorkQueue`].
///
/// Event sources receive this instead of the queue itself.
pub struct Enqueuer<K> {
    queue: WorkQueue<K>,
}

impl<K> Clone for Enqueuer<K> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<K> Enqueuer<K>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    /// Enqueue `key` for processing.
    pub fn enqueue(&self, key: K) {
        self.queue.add(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new("test", BackoffPolicy::default())
    }

    async fn try_get(queue: &WorkQueue<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_millis(50), queue.get())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_add_coalesces_pending_keys() {
        let queue = queue();
        queue.add("ns/a".to_string());
        queue.add("ns/a".to_string());
        queue.add("ns/b".to_string());

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await.as_deref(), Some("ns/b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_key_in_flight_is_not_handed_out_twice() {
        let queue = queue();
        queue.add("ns/a".to_string());

        let key = queue.get().await.unwrap();
        queue.add("ns/a".to_string());
        queue.add("ns/a".to_string());

        assert!(queue.is_empty());
        assert_eq!(try_get(&queue).await, None);

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(try_get(&queue).await.as_deref(), Some("ns/a"));
    }

    #[tokio::test]
    async fn test_done_without_readd_does_not_requeue() {
        let queue = queue();
        queue.add("ns/a".to_string());
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_blocks_until_add() {
        let queue = queue();
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueuer().enqueue("ns/late".to_string());

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("ns/late"));
    }

    #[tokio::test]
    async fn test_shut_down_unblocks_waiters() {
        let queue = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shut_down();

        for waiter in waiters {
            let got = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, None);
        }
    }

    #[tokio::test]
    async fn test_shut_down_discards_pending_and_ignores_adds() {
        let queue = queue();
        queue.add("ns/a".to_string());
        queue.shut_down();
        queue.add("ns/b".to_string());

        assert!(queue.is_empty());
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_add_after_delays_key() {
        let queue = queue();
        queue.add_after("ns/a".to_string(), Duration::from_millis(30));

        assert!(queue.is_empty());
        let got = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("ns/a"));
    }

    #[tokio::test]
    async fn test_rate_limited_tracks_requeues() {
        let queue = queue();
        let key = "ns/a".to_string();

        queue.add_rate_limited(key.clone());
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 2);

        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);

        let got = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap();
        assert_eq!(got, Some(key));
    }
}
