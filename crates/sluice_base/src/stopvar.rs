//! Cancellation-aware waits over [`notify::Var`].
//!
//! These helpers are the canonical way for a loop to follow a variable: read
//! a `(value, wakeup)` pair, act, and re-read after the wakeup fires. A
//! re-entrant `set` from inside a callback is observed on the next
//! iteration.
//!
//! [`notify::Var`]: crate::notify::Var

use std::future::Future;
use std::time::Duration;

use crate::notify::Var;
use crate::stopper::Stopper;

/// Blocks until the variable equals `target`, or shutdown begins.
pub async fn wait_for_value<T>(stop: &Stopper, target: T, var: &Var<T>) -> anyhow::Result<()>
where
    T: Clone + PartialEq,
{
    let stopping = stop.stopping();
    loop {
        let (current, wake) = var.get();
        if current == target {
            return Ok(());
        }
        tokio::select! {
            _ = wake.cancelled() => {}
            _ = stopping.cancelled() => {
                anyhow::bail!("shutdown while waiting for value");
            }
        }
    }
}

/// Invokes `apply(old, new)` once per observed transition, starting from
/// `init`. Returns the last observed value when shutdown begins.
pub async fn do_when_changed<T, F, Fut>(
    stop: &Stopper,
    init: T,
    var: &Var<T>,
    mut apply: F,
) -> anyhow::Result<T>
where
    T: Clone + PartialEq,
    F: FnMut(T, T) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let stopping = stop.stopping();
    let mut last = init;
    loop {
        let (current, wake) = var.get();
        if current != last {
            apply(last, current.clone()).await?;
            last = current;
            // Re-read immediately: a set made inside the callback must
            // trigger another iteration.
            continue;
        }
        tokio::select! {
            _ = wake.cancelled() => {}
            _ = stopping.cancelled() => return Ok(last),
        }
    }
}

/// Like [`do_when_changed`], but also invokes `apply(current, current)` on a
/// periodic tick.
pub async fn do_when_changed_or_interval<T, F, Fut>(
    stop: &Stopper,
    init: T,
    var: &Var<T>,
    period: Duration,
    mut apply: F,
) -> anyhow::Result<T>
where
    T: Clone + PartialEq,
    F: FnMut(T, T) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let stopping = stop.stopping();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last = init;
    loop {
        let (current, wake) = var.get();
        if current != last {
            apply(last, current.clone()).await?;
            last = current;
            continue;
        }
        tokio::select! {
            _ = wake.cancelled() => {}
            _ = ticker.tick() => {
                apply(current.clone(), current).await?;
            }
            _ = stopping.cancelled() => return Ok(last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn do_when_changed_observes_reentrant_sets() {
        let called = Arc::new(AtomicBool::new(false));
        let v = Arc::new(Var::of(-1));

        let stop = Stopper::new();
        {
            let stop = stop.clone();
            let called = Arc::clone(&called);
            let v = Arc::clone(&v);
            let task_stop = stop.clone();
            stop.spawn(async move {
                let v2 = Arc::clone(&v);
                do_when_changed(&task_stop, -1, &v, |old, new| {
                    let v2 = Arc::clone(&v2);
                    let called = Arc::clone(&called);
                    let task_stop = task_stop.clone();
                    async move {
                        match new {
                            1 => {
                                assert_eq!(old, -1);
                                // This set must cause another iteration.
                                v2.set(2);
                            }
                            2 => {
                                assert_eq!(old, 1);
                                called.store(true, Ordering::SeqCst);
                                task_stop.stop(Duration::from_secs(60));
                            }
                            other => panic!("unexpected value {other}"),
                        }
                        Ok(())
                    }
                })
                .await?;
                Ok(())
            });
        }

        v.set(1);
        stop.wait().await.expect("clean shutdown");
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn do_when_changed_or_interval_ticks() {
        let called = Arc::new(AtomicBool::new(false));
        let v = Arc::new(Var::of(-1));

        let stop = Stopper::new();
        {
            let called = Arc::clone(&called);
            let v = Arc::clone(&v);
            let task_stop = stop.clone();
            stop.spawn(async move {
                let v2 = Arc::clone(&v);
                do_when_changed_or_interval(
                    &task_stop,
                    -1,
                    &v,
                    Duration::from_millis(50),
                    |old, new| {
                        let v2 = Arc::clone(&v2);
                        let called = Arc::clone(&called);
                        let task_stop = task_stop.clone();
                        async move {
                            match new {
                                1 => {
                                    assert_eq!(old, -1);
                                    v2.set(2);
                                }
                                2 => {
                                    if old == 2 {
                                        // Reached via an interval tick.
                                        called.store(true, Ordering::SeqCst);
                                        task_stop.stop(Duration::from_secs(60));
                                    }
                                }
                                other => panic!("unexpected value {other}"),
                            }
                            Ok(())
                        }
                    },
                )
                .await?;
                Ok(())
            });
        }

        v.set(1);
        stop.wait().await.expect("clean shutdown");
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn wait_for_value_wakes_on_match() {
        let v = Arc::new(Var::of(0));
        let stop = Stopper::new();
        let reached = Arc::new(AtomicBool::new(false));

        {
            let v = Arc::clone(&v);
            let reached = Arc::clone(&reached);
            let task_stop = stop.clone();
            stop.spawn(async move {
                wait_for_value(&task_stop, 1, &v).await?;
                reached.store(true, Ordering::SeqCst);
                task_stop.stop(Duration::from_secs(60));
                Ok(())
            });
        }

        v.set(1);
        stop.wait().await.expect("clean shutdown");
        assert!(reached.load(Ordering::SeqCst));
    }
}
