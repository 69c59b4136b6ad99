//! Failure injection around another sequencer, for exercising retry paths.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sluice_base::stopper::Stopper;

use super::{Sequencer, StartOptions, Stats};
use crate::types::{Acceptor, TableBatch};

/// Wraps another sequencer and fails a configurable fraction of accepts
/// before they reach it. Deterministic under a fixed seed.
pub struct Chaos {
    inner: Arc<dyn Sequencer>,
    probability: f64,
    seed: u64,
}

impl Chaos {
    pub fn new(inner: Arc<dyn Sequencer>, probability: f64, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            inner,
            probability,
            seed,
        })
    }
}

#[async_trait]
impl Sequencer for Chaos {
    async fn start(
        &self,
        ctx: &Stopper,
        opts: &StartOptions,
    ) -> anyhow::Result<(Arc<dyn Acceptor>, Stats)> {
        let (acceptor, stats) = self.inner.start(ctx, opts).await?;
        Ok((
            Arc::new(ChaosAcceptor {
                inner: acceptor,
                probability: self.probability,
                rng: Mutex::new(SmallRng::seed_from_u64(self.seed)),
            }),
            stats,
        ))
    }
}

struct ChaosAcceptor {
    inner: Arc<dyn Acceptor>,
    probability: f64,
    rng: Mutex<SmallRng>,
}

#[async_trait]
impl Acceptor for ChaosAcceptor {
    async fn accept_table_batch(&self, batch: &TableBatch) -> anyhow::Result<()> {
        let unlucky = {
            let mut rng = self.rng.lock().expect("chaos rng poisoned");
            rng.gen::<f64>() < self.probability
        };
        if unlucky {
            anyhow::bail!("chaos: injected failure for {batch}");
        }
        self.inner.accept_table_batch(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::bypass::Bypass;
    use crate::sequencer::StartOptions;
    use crate::types::{TableGroup, TargetAcceptor};
    use sluice_base::hlc::{Range, Time};
    use sluice_base::ident::{Ident, Schema};
    use sluice_base::notify::Var;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingApplier(AtomicUsize);

    #[async_trait]
    impl crate::types::Applier for CountingApplier {
        async fn apply(&self, _batch: &TableBatch) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failures_are_injected_and_retries_succeed() {
        let schema = Schema::new("public");
        let applier = Arc::new(CountingApplier(AtomicUsize::new(0)));
        let opts = StartOptions {
            bounds: Arc::new(Var::of(Range::empty())),
            delegate: TargetAcceptor::new(applier.clone()),
            group: TableGroup {
                enclosing: schema.clone(),
                name: Ident::new("g"),
                tables: vec![schema.table("t")],
            },
        };
        let stop = Stopper::new();
        let chaos = Chaos::new(Bypass::new(), 0.5, 42);
        let (acceptor, _) = chaos.start(&stop, &opts).await.expect("start");

        let batch = TableBatch::new(
            schema.table("t"),
            Time::new(1, 0),
            vec![crate::types::Mutation {
                key: bytes::Bytes::from_static(b"[1]"),
                data: Some(bytes::Bytes::from_static(b"{}")),
                time: Time::new(1, 0),
                ..Default::default()
            }],
        );

        let mut failures = 0;
        for _ in 0..100 {
            // Callers retry on injected failures.
            while acceptor.accept_table_batch(&batch).await.is_err() {
                failures += 1;
            }
        }
        assert!(failures > 0, "expected some injected failures");
        assert_eq!(applier.0.load(Ordering::SeqCst), 100);
    }
}
