//! Stage-then-apply sequencer: arrival order, one transaction per batch.

use std::sync::Arc;

use async_trait::async_trait;
use sluice_base::notify::Var;
use sluice_base::stopper::Stopper;

use super::{advance_progress, seed_progress, Sequencer, StartOptions, Stats};
use crate::staging::store::StagingStore;
use crate::staging::Stagers;
use crate::types::{Acceptor, TableBatch};

/// Stages each batch for restart safety, applies it immediately through
/// the delegate, then marks it applied. Ordering is arrival order.
pub struct Immediate {
    stagers: Arc<Stagers>,
}

impl Immediate {
    pub fn new(stagers: Arc<Stagers>) -> Arc<Self> {
        Arc::new(Self { stagers })
    }
}

#[async_trait]
impl Sequencer for Immediate {
    async fn start(
        &self,
        ctx: &Stopper,
        opts: &StartOptions,
    ) -> anyhow::Result<(Arc<dyn Acceptor>, Stats)> {
        let stats: Stats = Arc::new(Var::of(seed_progress(&opts.group)));
        let acceptor = Arc::new(ImmediateAcceptor {
            stagers: Arc::clone(&self.stagers),
            store: self.stagers.store(),
            delegate: Arc::clone(&opts.delegate),
            stats: Arc::clone(&stats),
        });
        super::follow_bounds(ctx, Arc::clone(&opts.bounds), Arc::clone(&stats));
        Ok((acceptor, stats))
    }
}

struct ImmediateAcceptor {
    stagers: Arc<Stagers>,
    store: Arc<dyn StagingStore>,
    delegate: Arc<dyn Acceptor>,
    stats: Stats,
}

#[async_trait]
impl Acceptor for ImmediateAcceptor {
    async fn accept_table_batch(&self, batch: &TableBatch) -> anyhow::Result<()> {
        if !batch.is_empty() {
            anyhow::ensure!(
                !batch.time.is_zero(),
                "mutations must carry a timestamp above zero"
            );
            let stager = self.stagers.get(&batch.table).await?;
            stager.stage(&*self.store, batch.mutations.clone()).await?;
            self.delegate.accept_table_batch(batch).await?;
            stager.mark_applied(&*self.store, &batch.mutations).await?;
        }
        advance_progress(&self.stats, batch.time);
        Ok(())
    }
}
