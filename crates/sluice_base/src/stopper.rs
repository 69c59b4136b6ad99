//! Hierarchical lifecycle scopes with graceful shutdown.
//!
//! A [`Stopper`] owns a set of tasks. Stopping is cooperative: tasks are
//! expected to observe [`Stopper::stopping`] and exit within the grace
//! period; stragglers are reported, not killed. Nested stoppers share the
//! parent's cancellation so stopping a parent stops its children.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A cancellation scope that accounts for its tasks.
#[derive(Clone, Debug)]
pub struct Stopper {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    stopping: CancellationToken,
    tasks: TaskTracker,
    running: AtomicUsize,
    first_err: Mutex<Option<Arc<anyhow::Error>>>,
}

impl Stopper {
    /// A root stopper.
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// A stopper bound to an externally-owned cancellation token, such as a
    /// lease lifetime.
    pub fn with_token(stopping: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                stopping,
                tasks: TaskTracker::new(),
                running: AtomicUsize::new(0),
                first_err: Mutex::new(None),
            }),
        }
    }

    /// A nested stopper that stops when this one stops.
    pub fn child(&self) -> Stopper {
        Self::with_token(self.inner.stopping.child_token())
    }

    /// Registers a task. Returns false (and drops the future) once shutdown
    /// has begun.
    pub fn spawn<F>(&self, fut: F) -> bool
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.inner.stopping.is_cancelled() {
            tracing::warn!("task refused: stopper is shutting down");
            return false;
        }
        let inner = Arc::clone(&self.inner);
        inner.running.fetch_add(1, Ordering::SeqCst);
        self.inner.tasks.spawn(async move {
            let result = fut.await;
            inner.running.fetch_sub(1, Ordering::SeqCst);
            if let Err(err) = result {
                {
                    let mut slot = inner.first_err.lock().expect("stopper err slot poisoned");
                    if slot.is_none() {
                        *slot = Some(Arc::new(err));
                    } else {
                        tracing::debug!("additional task error after shutdown began");
                    }
                }
                // A failed task brings the whole scope down.
                inner.stopping.cancel();
                inner.tasks.close();
            }
        });
        true
    }

    /// Begins shutdown. Idempotent. Tasks still running after `grace` are
    /// reported as leaked.
    pub fn stop(&self, grace: Duration) {
        self.inner.stopping.cancel();
        self.inner.tasks.close();
        if grace > Duration::ZERO {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::select! {
                    _ = inner.tasks.wait() => {}
                    _ = tokio::time::sleep(grace) => {
                        let leaked = inner.running.load(Ordering::SeqCst);
                        if leaked > 0 {
                            tracing::warn!(leaked, grace = ?grace, "tasks still running after grace period");
                        }
                    }
                }
            });
        }
    }

    /// A token cancelled when shutdown begins.
    pub fn stopping(&self) -> CancellationToken {
        self.inner.stopping.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.is_cancelled()
    }

    /// Resolves once shutdown has begun and all tasks have exited.
    pub async fn done(&self) {
        self.inner.stopping.cancelled().await;
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Blocks for [`done`], surfacing the first task error.
    ///
    /// [`done`]: Stopper::done
    pub async fn wait(&self) -> anyhow::Result<()> {
        self.done().await;
        match self.err() {
            Some(err) => Err(anyhow::anyhow!("{err:#}")),
            None => Ok(()),
        }
    }

    /// The first task error, if any task has failed.
    pub fn err(&self) -> Option<Arc<anyhow::Error>> {
        self.inner
            .first_err
            .lock()
            .expect("stopper err slot poisoned")
            .clone()
    }
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn tasks_observe_stopping() {
        let stop = Stopper::new();
        let saw_stop = Arc::new(AtomicBool::new(false));
        let saw = Arc::clone(&saw_stop);
        let token = stop.stopping();
        assert!(stop.spawn(async move {
            token.cancelled().await;
            saw.store(true, Ordering::SeqCst);
            Ok(())
        }));

        stop.stop(Duration::from_secs(1));
        stop.wait().await.expect("clean shutdown");
        assert!(saw_stop.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn spawn_refused_after_stop() {
        let stop = Stopper::new();
        stop.stop(Duration::ZERO);
        assert!(!stop.spawn(async { Ok(()) }));
    }

    #[tokio::test]
    async fn first_task_error_is_surfaced() {
        let stop = Stopper::new();
        stop.spawn(async { Err(anyhow::anyhow!("boom")) });
        let err = stop.wait().await.expect_err("task error expected");
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn children_stop_with_parent() {
        let parent = Stopper::new();
        let child = parent.child();
        let token = child.stopping();
        child.spawn(async move {
            token.cancelled().await;
            Ok(())
        });

        parent.stop(Duration::ZERO);
        child.wait().await.expect("child drained");
        assert!(child.is_stopping());
    }
}
