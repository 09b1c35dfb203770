//! Keyed debouncing and latest-request-wins guarding.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// A map of cancellable timers. Scheduling a key replaces (and aborts) that
/// key's previous timer; other keys are untouched.
///
/// A timer whose quiet period has elapsed detaches itself before running its
/// task, so a task already in flight is never aborted by a later schedule.
pub struct Debouncer<K> {
    timers: Arc<Mutex<HashMap<K, Timer>>>,
    generation: AtomicU64,
}

impl<K> Default for Debouncer<K> {
    fn default() -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }
}

fn lock<K>(timers: &Mutex<HashMap<K, Timer>>) -> MutexGuard<'_, HashMap<K, Timer>> {
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once `delay` has passed without another `schedule` for `key`.
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, key: K, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let own_key = key.clone();

        // Held across spawn + insert so the timer cannot detach before it is registered.
        let mut guard = lock(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut map = lock(&timers);
                if map.get(&own_key).map(|t| t.generation) == Some(generation) {
                    map.remove(&own_key);
                }
            }
            task.await;
        });
        if let Some(previous) = guard.insert(key, Timer { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Drop the pending timer for `key`; returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.timers).remove(key) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, timer) in lock(&self.timers).drain() {
            timer.handle.abort();
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.timers).contains_key(key)
    }

    pub fn pending(&self) -> Vec<K> {
        lock(&self.timers).keys().cloned().collect()
    }
}

/// Ticket handed out by [`LatestOnly::issue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

/// Monotonic ticket counter: only the result of the most recently issued
/// ticket is worth applying.
#[derive(Debug, Clone, Default)]
pub struct LatestOnly {
    latest: Arc<AtomicU64>,
}

impl LatestOnly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> Ticket {
        Ticket(self.latest.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, ticket: Ticket) -> bool {
        self.latest.load(Ordering::SeqCst) == ticket.0
    }

    /// Await `fut` under a fresh ticket; `None` when a newer ticket was issued meanwhile.
    pub async fn run<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let ticket = self.issue();
        let out = fut.await;
        self.is_current(ticket).then_some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn bump(count: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let count = Arc::clone(count);
        async move {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_on_one_key_runs_once() {
        let debouncer = Debouncer::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            debouncer.schedule("notes", Duration::from_millis(700), bump(&count));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(debouncer.is_pending(&"notes"));
        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(debouncer.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let debouncer = Debouncer::new();
        let count = Arc::new(AtomicUsize::new(0));
        debouncer.schedule("s1__p1".to_string(), Duration::from_millis(500), bump(&count));
        debouncer.schedule("s1__p2".to_string(), Duration::from_millis(500), bump(&count));
        tokio::time::sleep(Duration::from_millis(300)).await;
        debouncer.schedule("s1__p2".to_string(), Duration::from_millis(500), bump(&count));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_work() {
        let debouncer = Debouncer::new();
        let count = Arc::new(AtomicUsize::new(0));
        debouncer.schedule(1u32, Duration::from_millis(500), bump(&count));
        debouncer.schedule(2u32, Duration::from_millis(500), bump(&count));
        assert!(debouncer.cancel(&1));
        assert!(!debouncer.cancel(&1));
        debouncer.cancel_all();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn only_latest_ticket_applies() {
        let latest = LatestOnly::new();
        let first = latest.issue();
        let second = latest.issue();
        assert!(!latest.is_current(first));
        assert!(latest.is_current(second));

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let gate = Arc::new(tokio::sync::Notify::new());
        let slow = tokio::spawn({
            let latest = latest.clone();
            let gate = Arc::clone(&gate);
            async move {
                latest
                    .run(async move {
                        let _ = started_tx.send(());
                        gate.notified().await;
                        "stale"
                    })
                    .await
            }
        });
        started_rx.await.unwrap();
        let fresh = latest.issue();
        gate.notify_one();
        assert_eq!(slow.await.unwrap(), None);
        assert!(latest.is_current(fresh));
        assert_eq!(latest.run(async { "fresh" }).await, Some("fresh"));
    }
}
