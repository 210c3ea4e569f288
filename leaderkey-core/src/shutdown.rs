//! Idempotent termination signal.

use std::sync::Arc;
use tokio::sync::watch;

/// One-way latch shared by everything that must stop when a member
/// terminates.
///
/// Triggering is idempotent and can happen from any number of threads, at
/// any time, including before anyone waits on it.
///
/// # Examples
///
/// ```rust
/// use leaderkey_core::ShutdownLatch;
///
/// let latch = ShutdownLatch::new();
/// assert!(latch.trigger());
/// assert!(!latch.trigger());
/// assert!(latch.is_triggered());
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownLatch {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownLatch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the latch. Returns `true` only for the call that flipped it.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the latch has fired.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_after_trigger_returns_immediately() {
        let latch = ShutdownLatch::new();
        latch.trigger();

        tokio::time::timeout(Duration::from_millis(100), latch.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_wakes_on_trigger() {
        let latch = ShutdownLatch::new();
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        latch.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_triggers_flip_once() {
        let latch = ShutdownLatch::new();
        let mut handles = Vec::new();

        for _ in 0..16 {
            let latch = latch.clone();
            handles.push(tokio::spawn(async move { latch.trigger() }));
        }

        let mut flipped = 0;
        for handle in handles {
            if handle.await.unwrap() {
                flipped += 1;
            }
        }

        assert_eq!(flipped, 1);
        assert!(latch.is_triggered());
    }

    #[test]
    fn test_pending_until_triggered() {
        let latch = ShutdownLatch::new();
        let mut wait = tokio_test::task::spawn(latch.wait());
        tokio_test::assert_pending!(wait.poll());

        latch.trigger();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }
}
