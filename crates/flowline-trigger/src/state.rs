//! Per-registration rate limiting: cooldown and debounce.
//!
//! Both use `tokio::time`, so tests can drive them with a paused clock.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Suppresses firings within `window` of the last accepted one.
#[derive(Debug)]
pub struct Cooldown {
    window: Duration,
    last: Mutex<Option<Instant>>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Accept a firing now, or reject it if still cooling down.
    ///
    /// Only accepted checks restart the window.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        if let Some(prev) = *last
            && now.duration_since(prev) < self.window
        {
            return false;
        }
        *last = Some(now);
        true
    }
}

/// Coalesces bursts per key: only the last call within `delay` runs.
pub struct Debouncer<K> {
    delay: Duration,
    pending: Mutex<HashMap<K, JoinHandle<()>>>,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Schedule `action` for `key`, replacing any pending action for it.
    pub fn schedule<F>(&self, key: K, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        let mut pending = self.pending.lock();
        pending.retain(|_, task| !task.is_finished());
        if let Some(previous) = pending.insert(key, task) {
            previous.abort();
        }
    }

    /// Number of keys whose action hasn't run yet.
    pub fn pending_len(&self) -> usize {
        let mut pending = self.pending.lock();
        pending.retain(|_, task| !task.is_finished());
        pending.len()
    }

    /// Abort every pending action.
    pub fn cancel_all(&self) {
        for (_, task) in self.pending.lock().drain() {
            task.abort();
        }
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        for (_, task) in self.pending.get_mut().drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_window() {
        let cd = Cooldown::new(Duration::from_millis(100));
        assert!(cd.try_acquire());
        assert!(!cd.try_acquire());

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!cd.try_acquire());

        // Rejected checks don't extend the window
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(cd.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cooldown_never_blocks() {
        let cd = Cooldown::new(Duration::ZERO);
        assert!(cd.try_acquire());
        assert!(cd.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_per_key() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let h = Arc::clone(&hits);
            debouncer.schedule("a", async move {
                h.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let h = Arc::clone(&hits);
        debouncer.schedule("b", async move {
            h.fetch_add(10, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert_eq!(debouncer.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_drops_finished_keys() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        for key in 0..10u32 {
            debouncer.schedule(key, async {});
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        debouncer.schedule(99, async {});
        assert_eq!(debouncer.pending.lock().len(), 1);
        assert_eq!(debouncer.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        debouncer.schedule(1u8, async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        debouncer.cancel_all();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
