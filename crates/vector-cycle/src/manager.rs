//! Cycle manager: one tokio task ticking a root callback.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::callbacks::{CycleCallback, ShouldAbort};
use crate::error::CycleError;

/// Delay between cycles.
///
/// A fixed ticker always waits the same interval. An exponential ticker
/// starts at `min`, multiplies by `base` after every cycle that did no
/// work, caps at `max`, and resets to `min` once work is done.
#[derive(Debug, Clone)]
pub struct CycleTicker {
    min: Duration,
    max: Duration,
    base: u32,
    current: Duration,
}

impl CycleTicker {
    pub fn fixed(interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        Self {
            min: interval,
            max: interval,
            base: 1,
            current: interval,
        }
    }

    pub fn exponential(min: Duration, max: Duration, base: u32) -> Self {
        let min = min.max(Duration::from_millis(1));
        Self {
            min,
            max: max.max(min),
            base: base.max(1),
            current: min,
        }
    }

    /// Fixed ticker from a millisecond setting.
    pub fn from_interval_ms(ms: u64) -> Self {
        Self::fixed(Duration::from_millis(ms))
    }

    /// Delay before the first cycle.
    pub fn initial(&self) -> Duration {
        self.min
    }

    /// Delay after a cycle that did (or did not) do work.
    pub fn next_delay(&mut self, worked: bool) -> Duration {
        if worked {
            self.current = self.min;
            return self.min;
        }
        let delay = self.current.saturating_mul(self.base).min(self.max);
        self.current = delay;
        delay
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives a root callback, usually a group, on a ticker.
///
/// Must be started from within a tokio runtime.
pub struct CycleManager {
    name: String,
    ticker: CycleTicker,
    root: CycleCallback,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for CycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleManager")
            .field("name", &self.name)
            .field("ticker", &self.ticker)
            .field("running", &self.is_running())
            .finish()
    }
}

impl CycleManager {
    pub fn new(ticker: CycleTicker, root: CycleCallback) -> Self {
        Self {
            name: "cycle".to_string(),
            ticker,
            root,
            running: Mutex::new(None),
        }
    }

    /// Name used in logs and timeout errors.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Spawn the ticking task.
    ///
    /// # Errors
    ///
    /// Returns `CycleError::AlreadyRunning` if the manager was started and
    /// not stopped since.
    pub fn start(&self) -> Result<(), CycleError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(CycleError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let task = Self::run(
            self.name.clone(),
            self.ticker.clone(),
            self.root.clone(),
            cancel.clone(),
        );
        *running = Some(Running {
            cancel,
            handle: tokio::spawn(task),
        });
        info!(manager = %self.name, "Cycle manager started");
        Ok(())
    }

    async fn run(name: String, mut ticker: CycleTicker, root: CycleCallback, cancel: CancellationToken) {
        let abort = ShouldAbort::from_token(cancel.clone());
        let mut delay = ticker.initial();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let worked = match AssertUnwindSafe(root(abort.clone())).catch_unwind().await {
                Ok(worked) => worked,
                Err(_) => {
                    error!(manager = %name, "Root cycle callback panicked");
                    false
                }
            };
            delay = ticker.next_delay(worked);
            debug!(manager = %name, worked, delay_ms = delay.as_millis() as u64, "Cycle finished");
        }
        debug!(manager = %name, "Cycle loop exited");
    }

    /// Stop ticking and wait up to `timeout` for the in-flight cycle.
    ///
    /// The in-flight cycle sees its `ShouldAbort` flip. If it has not
    /// finished in time the task is aborted and `CycleError::Timeout` is
    /// returned; the manager can be started again either way.
    pub async fn stop(&self, timeout: Duration) -> Result<(), CycleError> {
        let running = self.running.lock().take();
        let Some(Running { cancel, mut handle }) = running else {
            return Err(CycleError::NotRunning);
        };
        cancel.cancel();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => {
                info!(manager = %self.name, "Cycle manager stopped");
                Ok(())
            }
            Err(_) => {
                warn!(manager = %self.name, timeout_ms = timeout.as_millis() as u64, "Cycle did not finish, aborting");
                handle.abort();
                Err(CycleError::timeout(&self.name, timeout))
            }
        }
    }
}

impl Drop for CycleManager {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
            running.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{boxed_callback, CycleCallbackGroup};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fixed_ticker() {
        let mut ticker = CycleTicker::fixed(Duration::from_millis(100));
        assert_eq!(ticker.initial(), Duration::from_millis(100));
        assert_eq!(ticker.next_delay(false), Duration::from_millis(100));
        assert_eq!(ticker.next_delay(true), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_ticker_backs_off_when_idle() {
        let ms = Duration::from_millis;
        let mut ticker = CycleTicker::exponential(ms(10), ms(80), 2);
        let idle: Vec<_> = (0..5).map(|_| ticker.next_delay(false)).collect();
        assert_eq!(idle, vec![ms(20), ms(40), ms(80), ms(80), ms(80)]);
        assert_eq!(ticker.next_delay(true), ms(10));
        assert_eq!(ticker.next_delay(false), ms(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_ticks_until_stopped() {
        let group = CycleCallbackGroup::new("flush", 1);
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            group
                .register(
                    "count",
                    true,
                    boxed_callback(move |_| {
                        let hits = Arc::clone(&hits);
                        async move {
                            hits.fetch_add(1, Ordering::SeqCst);
                            true
                        }
                    }),
                )
                .unwrap();
        }

        let manager = CycleManager::new(CycleTicker::fixed(Duration::from_millis(5)), group.as_callback())
            .with_name("flush");
        manager.start().unwrap();
        assert!(matches!(manager.start(), Err(CycleError::AlreadyRunning)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.stop(Duration::from_secs(1)).await.unwrap();

        let seen = hits.load(Ordering::SeqCst);
        assert!(seen >= 3, "only {seen} cycles ran");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hits.load(Ordering::SeqCst), seen);
        assert!(!manager.is_running());
        assert!(matches!(manager.stop(Duration::from_secs(1)).await, Err(CycleError::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signals_should_abort() {
        let saw_abort = Arc::new(AtomicUsize::new(0));
        let root = {
            let saw_abort = Arc::clone(&saw_abort);
            boxed_callback(move |abort: ShouldAbort| {
                let saw_abort = Arc::clone(&saw_abort);
                async move {
                    while !abort.get() {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    saw_abort.fetch_add(1, Ordering::SeqCst);
                    false
                }
            })
        };

        let manager = CycleManager::new(CycleTicker::fixed(Duration::from_millis(1)), root);
        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(saw_abort.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_times_out_on_stuck_cycle() {
        let root = boxed_callback(|_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            true
        });
        let manager = CycleManager::new(CycleTicker::fixed(Duration::from_millis(1)), root)
            .with_name("stuck");
        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = manager.stop(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, CycleError::Timeout { ref id, .. } if id == "stuck"));
        // Restartable after a failed stop
        manager.start().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_cycles_back_off_exponentially() {
        let ms = Duration::from_millis;
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let root = {
            let seen = Arc::clone(&seen);
            boxed_callback(move |_| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(tokio::time::Instant::now());
                    false
                }
            })
        };
        let manager = CycleManager::new(CycleTicker::exponential(ms(10), ms(80), 2), root);
        let started = tokio::time::Instant::now();
        manager.start().unwrap();
        tokio::time::sleep(ms(235)).await;
        manager.stop(Duration::from_secs(1)).await.unwrap();

        // Runs at 10, 30, 70, 150 and 230ms; the clock only moves to timer deadlines
        let offsets: Vec<Duration> = seen.lock().iter().map(|t| *t - started).collect();
        assert_eq!(offsets.len(), 5, "offsets: {offsets:?}");
        for (offset, expected) in offsets.iter().zip([10, 30, 70, 150, 230]) {
            assert!(
                *offset >= ms(expected) && *offset < ms(expected + 5),
                "expected ~{expected}ms, got {offset:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_panic_does_not_kill_loop() {
        let hits = Arc::new(AtomicUsize::new(0));
        let root = {
            let hits = Arc::clone(&hits);
            boxed_callback(move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first cycle fails");
                    }
                    true
                }
            })
        };
        let manager = CycleManager::new(CycleTicker::fixed(Duration::from_millis(2)), root);
        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.stop(Duration::from_secs(1)).await.unwrap();
        assert!(hits.load(Ordering::SeqCst) >= 2);
    }
}
