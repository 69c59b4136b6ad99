//! Overlapping windowed drain: workers own disjoint key-hash shards.
//!
//! Within a shard, rows apply in strict HLC order; across shards there is
//! no ordering, and progress is reported as the minimum watermark over all
//! shards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sluice_base::hlc::Time;
use sluice_base::notify::Var;
use sluice_base::stopper::Stopper;

use super::serial::Drainer;
use super::{
    advance_progress, seed_progress, Sequencer, SequencerConfig, StagingAcceptor, StartOptions,
    Stats,
};
use crate::staging::Stagers;
use crate::types::Acceptor;

/// Sharded staging sequencer.
pub struct Shingle {
    cfg: SequencerConfig,
    stagers: Arc<Stagers>,
}

impl Shingle {
    pub fn new(cfg: SequencerConfig, stagers: Arc<Stagers>) -> Arc<Self> {
        Arc::new(Self { cfg, stagers })
    }
}

#[async_trait]
impl Sequencer for Shingle {
    async fn start(
        &self,
        ctx: &Stopper,
        opts: &StartOptions,
    ) -> anyhow::Result<(Arc<dyn Acceptor>, Stats)> {
        let stats: Stats = Arc::new(Var::of(seed_progress(&opts.group)));
        let dirty = Arc::new(Var::of(0u64));
        let acceptor = Arc::new(StagingAcceptor {
            stagers: Arc::clone(&self.stagers),
            store: self.stagers.store(),
            dirty: Arc::clone(&dirty),
        });

        let workers = self.cfg.parallelism.max(1);
        let watermarks: Arc<Vec<Var<Time>>> =
            Arc::new((0..workers).map(|_| Var::of(Time::ZERO)).collect());

        for index in 0..workers {
            let drainer = Drainer {
                stagers: Arc::clone(&self.stagers),
                store: self.stagers.store(),
                delegate: Arc::clone(&opts.delegate),
                group: opts.group.clone(),
                shard: Some((index, workers)),
            };
            let bounds = Arc::clone(&opts.bounds);
            let dirty = Arc::clone(&dirty);
            let watermarks = Arc::clone(&watermarks);
            let worker_stats = Arc::clone(&stats);
            let stopping = ctx.stopping();
            ctx.spawn(async move {
                loop {
                    let (current, bounds_wake) = bounds.get();
                    let (_, dirty_wake) = dirty.get();
                    if drainer.drain(current).await? {
                        watermarks[index].set(current.max_inclusive());
                        let low = watermarks
                            .iter()
                            .map(|w| w.peek())
                            .min()
                            .unwrap_or(Time::ZERO);
                        advance_progress(&worker_stats, low);
                        if index == 0 {
                            // One retirement sweep per group is plenty.
                            drainer.retire(low.next()).await?;
                        }
                        tokio::select! {
                            _ = bounds_wake.cancelled() => {}
                            _ = dirty_wake.cancelled() => {}
                            _ = stopping.cancelled() => return Ok(()),
                        }
                    } else {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                            _ = stopping.cancelled() => return Ok(()),
                        }
                    }
                }
            });
        }

        Ok((acceptor, stats))
    }
}
