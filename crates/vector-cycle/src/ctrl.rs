//! Control handles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, FutureExt, StreamExt};
use tracing::warn;

use crate::error::CycleError;

/// Start/stop control over a registered callback or a set of them.
#[async_trait]
pub trait CycleCallbackCtrl: Send + Sync {
    fn is_active(&self) -> bool;

    /// Let later cycles run the callback again.
    fn activate(&self) -> Result<(), CycleError>;

    /// Stop later cycles from running the callback and wait up to `timeout`
    /// for the in-flight run. On timeout the callback is left active.
    async fn deactivate(&self, timeout: Duration) -> Result<(), CycleError>;

    /// Wait for the in-flight run without changing the active flag.
    async fn await_idle(&self, timeout: Duration) -> Result<(), CycleError>;

    /// Remove the callback from its group, then wait for the in-flight run.
    async fn unregister(&self, timeout: Duration) -> Result<(), CycleError>;
}

fn combine(mut errors: Vec<CycleError>) -> Result<(), CycleError> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(CycleError::Combined(errors)),
    }
}

/// One control over several children, driven concurrently.
///
/// Used where routines over the same data must be quiesced together,
/// such as the commit logger and tombstone cleanup of one vector index.
pub struct CombinedCtrl {
    routines_limit: usize,
    ctrls: Vec<Arc<dyn CycleCallbackCtrl>>,
}

impl std::fmt::Debug for CombinedCtrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinedCtrl")
            .field("routines_limit", &self.routines_limit)
            .field("children", &self.ctrls.len())
            .finish()
    }
}

impl CombinedCtrl {
    pub fn new(routines_limit: usize, ctrls: Vec<Arc<dyn CycleCallbackCtrl>>) -> Self {
        Self {
            routines_limit: routines_limit.max(1),
            ctrls,
        }
    }

    pub fn len(&self) -> usize {
        self.ctrls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ctrls.is_empty()
    }

    async fn each<'a, F>(&'a self, op: F) -> Vec<(usize, Result<(), CycleError>)>
    where
        F: Fn(&'a dyn CycleCallbackCtrl) -> futures::future::BoxFuture<'a, Result<(), CycleError>> + Send + Sync + 'a,
    {
        stream::iter(self.ctrls.iter().enumerate())
            .map(|(i, ctrl): (usize, &'a Arc<dyn CycleCallbackCtrl>)| {
                let fut = op(ctrl.as_ref());
                async move { (i, fut.await) }
            })
            .buffer_unordered(self.routines_limit)
            .collect::<Vec<_>>()
            .boxed()
            .await
    }
}

#[async_trait]
impl CycleCallbackCtrl for CombinedCtrl {
    /// Active while any child is.
    fn is_active(&self) -> bool {
        self.ctrls.iter().any(|c| c.is_active())
    }

    fn activate(&self) -> Result<(), CycleError> {
        combine(
            self.ctrls
                .iter()
                .filter_map(|c| c.activate().err())
                .collect(),
        )
    }

    /// Deactivate all children. If any fails, children that were stopped by
    /// this call are activated again before the error is returned.
    async fn deactivate(&self, timeout: Duration) -> Result<(), CycleError> {
        let was_active: Vec<bool> = self.ctrls.iter().map(|c| c.is_active()).collect();
        let results = self.each(|c| c.deactivate(timeout)).await;

        let mut stopped = Vec::new();
        let mut errors = Vec::new();
        for (i, result) in results {
            match result {
                Ok(()) => stopped.push(i),
                Err(e) => errors.push(e),
            }
        }
        if errors.is_empty() {
            return Ok(());
        }

        for i in stopped.into_iter().filter(|i| was_active[*i]) {
            if let Err(e) = self.ctrls[i].activate() {
                warn!(error = %e, "Failed to reactivate cycle callback");
            }
        }
        combine(errors)
    }

    async fn await_idle(&self, timeout: Duration) -> Result<(), CycleError> {
        let results = self.each(|c| c.await_idle(timeout)).await;
        combine(results.into_iter().filter_map(|(_, r)| r.err()).collect())
    }

    async fn unregister(&self, timeout: Duration) -> Result<(), CycleError> {
        let results = self.each(|c| c.unregister(timeout)).await;
        combine(results.into_iter().filter_map(|(_, r)| r.err()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{boxed_callback, CallbackCtrl, CycleCallbackGroup, ShouldAbort};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn slow(ms: u64, done: &Arc<AtomicUsize>) -> crate::CycleCallback {
        let done = Arc::clone(done);
        boxed_callback(move |_| {
            let done = Arc::clone(&done);
            async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                done.fetch_add(1, Ordering::SeqCst);
                true
            }
        })
    }

    fn combined(ctrls: Vec<CallbackCtrl>) -> CombinedCtrl {
        CombinedCtrl::new(
            2,
            ctrls
                .into_iter()
                .map(|c| Arc::new(c) as Arc<dyn CycleCallbackCtrl>)
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_deactivate_quiesces_every_child() {
        let commit = CycleCallbackGroup::new("commit_logger", 1);
        let cleanup = CycleCallbackGroup::new("tombstone_cleanup", 1);
        let done = Arc::new(AtomicUsize::new(0));
        let a = commit.register("vector", true, slow(60, &done)).unwrap();
        let b = cleanup.register("vector", true, slow(30, &done)).unwrap();
        let ctrl = combined(vec![a, b]);
        assert_eq!(ctrl.len(), 2);

        let runs = {
            let (commit, cleanup) = (commit.clone(), cleanup.clone());
            tokio::spawn(async move {
                tokio::join!(
                    commit.cycle_callback(ShouldAbort::never()),
                    cleanup.cycle_callback(ShouldAbort::never())
                )
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        ctrl.deactivate(Duration::from_secs(2)).await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert!(!ctrl.is_active());
        runs.await.unwrap();

        assert!(!commit.cycle_callback(ShouldAbort::never()).await);
        ctrl.activate().unwrap();
        assert!(ctrl.is_active());
        assert!(cleanup.cycle_callback(ShouldAbort::never()).await);
    }

    #[tokio::test]
    async fn test_failed_deactivate_restores_stopped_children() {
        let group = CycleCallbackGroup::new("shard", 2);
        let done = Arc::new(AtomicUsize::new(0));
        let quick = group.register("quick", true, slow(1, &done)).unwrap();
        let stuck = group.register("stuck", true, slow(200, &done)).unwrap();
        let idle = group.register("idle", false, slow(1, &done)).unwrap();
        let ctrl = combined(vec![quick, stuck, idle]);

        let run = {
            let group = group.clone();
            tokio::spawn(async move { group.cycle_callback(ShouldAbort::never()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = ctrl.deactivate(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, CycleError::Timeout { ref id, .. } if id == "shard/stuck"));
        assert!(ctrl.ctrls[0].is_active());
        assert!(ctrl.ctrls[1].is_active());
        // Was inactive before, stays inactive
        assert!(!ctrl.ctrls[2].is_active());
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_all_children() {
        let group = CycleCallbackGroup::new("flush", 1);
        let done = Arc::new(AtomicUsize::new(0));
        let a = group.register("a", true, slow(1, &done)).unwrap();
        let b = group.register("b", true, slow(1, &done)).unwrap();
        let ctrl = combined(vec![a, b]);

        ctrl.await_idle(Duration::from_millis(50)).await.unwrap();
        ctrl.unregister(Duration::from_secs(1)).await.unwrap();
        assert!(group.callback_ids().is_empty());

        let err = ctrl.activate().unwrap_err();
        assert!(matches!(err, CycleError::Combined(ref all) if all.len() == 2));
    }

    #[tokio::test]
    async fn test_combined_ctrls_nest() {
        let group = CycleCallbackGroup::new("store", 1);
        let done = Arc::new(AtomicUsize::new(0));
        let inner = combined(vec![group.register("a", true, slow(1, &done)).unwrap()]);
        let children: Vec<Arc<dyn CycleCallbackCtrl>> =
            vec![Arc::new(inner), Arc::new(CallbackCtrl::noop())];
        let outer = CombinedCtrl::new(1, children);

        outer.deactivate(Duration::from_secs(1)).await.unwrap();
        assert!(!outer.is_active());
        assert!(!group.cycle_callback(ShouldAbort::never()).await);
        outer.activate().unwrap();
        assert!(outer.is_active());
    }
}
