//! Singleton leases for work that must run on at most one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use sluice_base::notify::Var;
use tokio_util::sync::CancellationToken;

use crate::types::CancelSingleton;

/// Work executed while a singleton lease is held. The token is cancelled if
/// the lease is lost externally. The function may run again after a lost
/// lease is re-acquired.
pub type SingletonWork =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Provider of named singleton leases.
#[async_trait]
pub trait Leases: Send + Sync {
    /// Acquires the named lease, waiting for any current holder, then runs
    /// `work`. Returning [`CancelSingleton`] from the work function
    /// releases the lease and reports success; any other error is
    /// surfaced.
    async fn singleton(&self, name: &str, work: SingletonWork) -> anyhow::Result<()>;
}

/// Process-local lease provider for embedded deployments and tests.
/// Contenders for a held lease block until the holder releases it.
#[derive(Default)]
pub struct MemoryLeases {
    held: Mutex<HashMap<String, ()>>,
    released: Var<u64>,
}

impl MemoryLeases {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            held: Mutex::new(HashMap::new()),
            released: Var::of(0),
        })
    }

    fn try_acquire(&self, name: &str) -> bool {
        let mut held = self.held.lock().expect("lease map poisoned");
        if held.contains_key(name) {
            false
        } else {
            held.insert(name.to_string(), ());
            true
        }
    }

    fn release(&self, name: &str) {
        self.held.lock().expect("lease map poisoned").remove(name);
        self.released.update(|n| *n += 1);
    }
}

#[async_trait]
impl Leases for MemoryLeases {
    async fn singleton(&self, name: &str, work: SingletonWork) -> anyhow::Result<()> {
        loop {
            let (_, wake) = self.released.get();
            if self.try_acquire(name) {
                break;
            }
            wake.cancelled().await;
        }
        tracing::trace!(lease = name, "singleton lease acquired");

        // In-process leases are never revoked from outside; the token only
        // exists to satisfy the holder-side contract.
        let token = CancellationToken::new();
        let result = work(token).await;
        self.release(name);
        tracing::trace!(lease = name, "singleton lease released");

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is::<CancelSingleton>() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn second_contender_waits_for_release() {
        let leases = MemoryLeases::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let leases = Arc::clone(&leases);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                leases
                    .singleton(
                        "group",
                        Arc::new(move |_| {
                            let running = Arc::clone(&running);
                            let peak = Arc::clone(&peak);
                            Box::pin(async move {
                                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(20)).await;
                                running.fetch_sub(1, Ordering::SeqCst);
                                Err(CancelSingleton.into())
                            })
                        }),
                    )
                    .await
            }));
        }

        for handle in handles {
            handle.await.expect("join").expect("lease work");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1, "exactly one holder at a time");
    }

    #[tokio::test]
    async fn cancel_singleton_is_not_an_error() {
        let leases = MemoryLeases::new();
        leases
            .singleton("g", Arc::new(|_| Box::pin(async { Err(CancelSingleton.into()) })))
            .await
            .expect("orderly release");
    }
}
