//! Pass-through sequencer for sources that already guarantee ordering.

use std::sync::Arc;

use async_trait::async_trait;
use sluice_base::notify::Var;
use sluice_base::stopper::Stopper;

use super::{advance_progress, seed_progress, Sequencer, StartOptions, Stats};
use crate::types::{Acceptor, TableBatch};

/// Forwards batches straight to the delegate. No staging, no bounds
/// dependency.
#[derive(Default)]
pub struct Bypass;

impl Bypass {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Sequencer for Bypass {
    async fn start(
        &self,
        ctx: &Stopper,
        opts: &StartOptions,
    ) -> anyhow::Result<(Arc<dyn Acceptor>, Stats)> {
        let stats: Stats = Arc::new(Var::of(seed_progress(&opts.group)));
        let acceptor = Arc::new(BypassAcceptor {
            delegate: Arc::clone(&opts.delegate),
            stats: Arc::clone(&stats),
        });
        super::follow_bounds(ctx, Arc::clone(&opts.bounds), Arc::clone(&stats));
        Ok((acceptor, stats))
    }
}

struct BypassAcceptor {
    delegate: Arc<dyn Acceptor>,
    stats: Stats,
}

#[async_trait]
impl Acceptor for BypassAcceptor {
    async fn accept_table_batch(&self, batch: &TableBatch) -> anyhow::Result<()> {
        if !batch.is_empty() {
            self.delegate.accept_table_batch(batch).await?;
        }
        advance_progress(&self.stats, batch.time);
        Ok(())
    }
}
