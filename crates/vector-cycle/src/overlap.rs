//! Self-overlap protection for cycle callbacks.
//!
//! A callback that is still running when the next cycle reaches it is
//! skipped for that cycle. The guard also lets controls wait for the
//! in-flight run to finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Flag {
    running: AtomicBool,
    idle: Notify,
}

/// Tracks whether a callback is running and wakes waiters when it stops.
#[derive(Debug, Clone, Default)]
pub struct OverlapGuard {
    flag: Arc<Flag>,
}

impl OverlapGuard {
    /// Create a guard with no run in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the running slot.
    ///
    /// Returns `None` when a previous run still holds it. The slot is
    /// released when the returned guard drops, including on panic.
    pub fn try_acquire(&self) -> Option<RunGuard> {
        self.flag
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard {
                flag: Arc::clone(&self.flag),
            })
    }

    /// Whether a run currently holds the guard.
    pub fn is_running(&self) -> bool {
        self.flag.running.load(Ordering::SeqCst)
    }

    /// Wait until no run is in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        if !self.is_running() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.flag.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if !self.is_running() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

/// Holds the running slot of an [`OverlapGuard`].
#[derive(Debug)]
pub struct RunGuard {
    flag: Arc<Flag>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.running.store(false, Ordering::SeqCst);
        self.flag.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let guard = OverlapGuard::new();
        let first = guard.try_acquire();
        assert!(first.is_some());
        assert!(guard.is_running());
        assert!(guard.try_acquire().is_none());

        drop(first);
        assert!(!guard.is_running());
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn test_clones_share_state() {
        let guard = OverlapGuard::new();
        let other = guard.clone();
        let _held = guard.try_acquire().unwrap();
        assert!(other.is_running());
        assert!(other.try_acquire().is_none());
    }

    #[test]
    fn test_released_on_panic() {
        let guard = OverlapGuard::new();
        let inner = guard.clone();
        let result = std::thread::spawn(move || {
            let _held = inner.try_acquire().unwrap();
            panic!("boom");
        })
        .join();
        assert!(result.is_err());
        assert!(!guard.is_running());
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let guard = OverlapGuard::new();
        assert!(guard.wait_idle(Duration::from_millis(10)).await);

        let held = guard.try_acquire().unwrap();
        assert!(!guard.wait_idle(Duration::from_millis(20)).await);

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }
}
