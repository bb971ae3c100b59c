//! Callback groups.
//!
//! A [`CycleCallbackGroup`] holds named callbacks and runs the active ones
//! each time its own `cycle_callback` is invoked, with at most
//! `routines_limit` of them in flight. A group is itself a callback, so
//! groups nest: index groups hold store groups, which hold shard groups.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{stream, FutureExt, StreamExt};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::ctrl::CycleCallbackCtrl;
use crate::error::CycleError;
use crate::overlap::OverlapGuard;
use crate::registry::{CycleRegistry, RunOutcome};

/// Periodic unit of work. Resolves to `true` when it did something.
pub type CycleCallback = Arc<dyn Fn(ShouldAbort) -> BoxFuture<'static, bool> + Send + Sync>;

/// Wrap an async closure as a [`CycleCallback`].
pub fn boxed_callback<F, Fut>(f: F) -> CycleCallback
where
    F: Fn(ShouldAbort) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move |abort| f(abort).boxed())
}

/// Polled by long callbacks to find out whether they should stop early.
#[derive(Clone)]
pub struct ShouldAbort(Arc<dyn Fn() -> bool + Send + Sync>);

impl ShouldAbort {
    /// Wrap a check that returns true once the cycle should stop.
    pub fn new(f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// A check that never asks to stop.
    pub fn never() -> Self {
        Self::new(|| false)
    }

    /// Aborts once `token` is cancelled.
    pub fn from_token(token: CancellationToken) -> Self {
        Self::new(move || token.is_cancelled())
    }

    /// True once the running callback should return early.
    pub fn get(&self) -> bool {
        (self.0)()
    }
}

impl fmt::Debug for ShouldAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ShouldAbort").field(&self.get()).finish()
    }
}

struct Entry {
    id: String,
    callback: CycleCallback,
    active: AtomicBool,
    unregistered: AtomicBool,
    overlap: OverlapGuard,
}

impl Entry {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

struct GroupInner {
    id: String,
    routines_limit: usize,
    entries: RwLock<Vec<Arc<Entry>>>,
    registry: CycleRegistry,
    noop: bool,
}

/// Named set of callbacks run together on each cycle.
#[derive(Clone)]
pub struct CycleCallbackGroup {
    inner: Arc<GroupInner>,
}

impl fmt::Debug for CycleCallbackGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleCallbackGroup")
            .field("id", &self.inner.id)
            .field("routines_limit", &self.inner.routines_limit)
            .field("callbacks", &self.inner.entries.read().len())
            .field("noop", &self.inner.noop)
            .finish()
    }
}

impl CycleCallbackGroup {
    /// Create a group. A `routines_limit` of 0 is treated as 1.
    pub fn new(id: impl Into<String>, routines_limit: usize) -> Self {
        Self::build(id.into(), routines_limit.max(1), false)
    }

    /// A group that registers nothing and never runs anything.
    pub fn noop() -> Self {
        Self::build("noop".to_string(), 1, true)
    }

    fn build(id: String, routines_limit: usize, noop: bool) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                id,
                routines_limit,
                entries: RwLock::new(Vec::new()),
                registry: CycleRegistry::new(),
                noop,
            }),
        }
    }

    /// Group id, used as the prefix of its callbacks' labels.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Maximum callbacks run concurrently per cycle.
    pub fn routines_limit(&self) -> usize {
        self.inner.routines_limit
    }

    pub fn is_noop(&self) -> bool {
        self.inner.noop
    }

    /// Run status of this group's callbacks.
    pub fn registry(&self) -> &CycleRegistry {
        &self.inner.registry
    }

    /// Ids of registered callbacks in registration order.
    pub fn callback_ids(&self) -> Vec<String> {
        self.inner.entries.read().iter().map(|e| e.id.clone()).collect()
    }

    /// Add a callback.
    ///
    /// Returns a control handle. With `auto_start` false the callback stays
    /// inactive until [`CycleCallbackCtrl::activate`] is called.
    ///
    /// # Errors
    ///
    /// Returns `CycleError::DuplicateId` if `id` is already registered here.
    pub fn register(
        &self,
        id: impl Into<String>,
        auto_start: bool,
        callback: CycleCallback,
    ) -> Result<CallbackCtrl, CycleError> {
        let id = id.into();
        if self.inner.noop {
            return Ok(CallbackCtrl::noop());
        }

        let mut entries = self.inner.entries.write();
        if entries.iter().any(|e| e.id == id) {
            return Err(CycleError::DuplicateId(format!("{}/{}", self.inner.id, id)));
        }
        let entry = Arc::new(Entry {
            id: id.clone(),
            callback,
            active: AtomicBool::new(auto_start),
            unregistered: AtomicBool::new(false),
            overlap: OverlapGuard::new(),
        });
        entries.push(Arc::clone(&entry));
        self.inner.registry.register(&id, auto_start);
        debug!(group = %self.inner.id, callback = %id, auto_start, "Registered cycle callback");

        Ok(CallbackCtrl {
            handle: Some(Handle {
                entry,
                group: Arc::downgrade(&self.inner),
            }),
        })
    }

    /// Register a child group as one callback of this group.
    pub fn register_group(
        &self,
        id: impl Into<String>,
        auto_start: bool,
        child: &CycleCallbackGroup,
    ) -> Result<CallbackCtrl, CycleError> {
        self.register(id, auto_start, child.as_callback())
    }

    /// Run every active callback once.
    ///
    /// Callbacks still running from an earlier cycle are skipped. Returns
    /// whether any callback did work.
    pub async fn cycle_callback(&self, should_abort: ShouldAbort) -> bool {
        if self.inner.noop {
            return false;
        }
        let active: Vec<Arc<Entry>> = self
            .inner
            .entries
            .read()
            .iter()
            .filter(|e| e.is_active())
            .cloned()
            .collect();
        if active.is_empty() {
            return false;
        }

        let inner = &self.inner;
        stream::iter(active)
            .map(|entry| {
                let abort = should_abort.clone();
                async move {
                    if abort.get() {
                        return false;
                    }
                    inner.run(&entry, abort).await
                }
            })
            .buffer_unordered(inner.routines_limit)
            .fold(false, |any, worked| async move { any || worked })
            .await
    }

    /// This group as a callback for a parent group or a manager.
    pub fn as_callback(&self) -> CycleCallback {
        let group = self.clone();
        Arc::new(move |abort| {
            let group = group.clone();
            async move { group.cycle_callback(abort).await }.boxed()
        })
    }
}

impl GroupInner {
    async fn run(&self, entry: &Entry, abort: ShouldAbort) -> bool {
        let Some(_running) = entry.overlap.try_acquire() else {
            debug!(group = %self.id, callback = %entry.id, "Previous run still in flight, skipping");
            self.registry.record_skip(&entry.id);
            return false;
        };
        // Deactivated after this cycle picked it up
        if !entry.is_active() {
            return false;
        }

        self.registry.record_start(&entry.id);
        let started = Instant::now();
        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| (entry.callback)(abort))) {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(panic) => Err(panic),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (worked, outcome) = match result {
            Ok(true) => (true, RunOutcome::Worked),
            Ok(false) => (false, RunOutcome::Idle),
            Err(panic) => {
                error!(
                    group = %self.id,
                    callback = %entry.id,
                    panic = %panic_message(panic.as_ref()),
                    "Cycle callback panicked"
                );
                (false, RunOutcome::Panicked)
            }
        };
        self.registry.record_complete(&entry.id, outcome, duration_ms);
        worked
    }

    fn remove(&self, entry: &Arc<Entry>) {
        self.entries.write().retain(|e| !Arc::ptr_eq(e, entry));
        self.registry.unregister(&entry.id);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Handle {
    entry: Arc<Entry>,
    group: Weak<GroupInner>,
}

/// Control handle for one registered callback.
///
/// The noop variant reports inactive and accepts every request.
pub struct CallbackCtrl {
    handle: Option<Handle>,
}

impl fmt::Debug for CallbackCtrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.handle {
            Some(h) => f
                .debug_struct("CallbackCtrl")
                .field("id", &h.entry.id)
                .field("active", &h.entry.is_active())
                .finish(),
            None => f.write_str("CallbackCtrl(noop)"),
        }
    }
}

impl CallbackCtrl {
    pub fn noop() -> Self {
        Self { handle: None }
    }

    pub fn is_noop(&self) -> bool {
        self.handle.is_none()
    }

    fn label(h: &Handle) -> String {
        match h.group.upgrade() {
            Some(group) => format!("{}/{}", group.id, h.entry.id),
            None => h.entry.id.clone(),
        }
    }

    fn set_active(h: &Handle, active: bool) {
        h.entry.active.store(active, Ordering::SeqCst);
        if let Some(group) = h.group.upgrade() {
            group.registry.set_active(&h.entry.id, active);
        }
    }
}

#[async_trait]
impl CycleCallbackCtrl for CallbackCtrl {
    fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.entry.is_active())
    }

    fn activate(&self) -> Result<(), CycleError> {
        let Some(h) = &self.handle else {
            return Ok(());
        };
        if h.entry.unregistered.load(Ordering::SeqCst) {
            return Err(CycleError::Unregistered(Self::label(h)));
        }
        Self::set_active(h, true);
        debug!(callback = %Self::label(h), "Cycle callback activated");
        Ok(())
    }

    async fn deactivate(&self, timeout: Duration) -> Result<(), CycleError> {
        let Some(h) = &self.handle else {
            return Ok(());
        };
        if h.entry.unregistered.load(Ordering::SeqCst) {
            return Ok(());
        }
        let was_active = h.entry.active.swap(false, Ordering::SeqCst);
        if !h.entry.overlap.wait_idle(timeout).await {
            if was_active {
                Self::set_active(h, true);
            }
            return Err(CycleError::timeout(&Self::label(h), timeout));
        }
        Self::set_active(h, false);
        debug!(callback = %Self::label(h), "Cycle callback deactivated");
        Ok(())
    }

    async fn await_idle(&self, timeout: Duration) -> Result<(), CycleError> {
        let Some(h) = &self.handle else {
            return Ok(());
        };
        if h.entry.overlap.wait_idle(timeout).await {
            Ok(())
        } else {
            Err(CycleError::timeout(&Self::label(h), timeout))
        }
    }

    async fn unregister(&self, timeout: Duration) -> Result<(), CycleError> {
        let Some(h) = &self.handle else {
            return Ok(());
        };
        if h.entry.unregistered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let label = Self::label(h);
        h.entry.active.store(false, Ordering::SeqCst);
        if let Some(group) = h.group.upgrade() {
            group.remove(&h.entry);
        }
        info!(callback = %label, "Cycle callback unregistered");
        if h.entry.overlap.wait_idle(timeout).await {
            Ok(())
        } else {
            Err(CycleError::timeout(&label, timeout))
        }
    }
}
