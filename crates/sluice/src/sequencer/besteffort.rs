//! Best-effort sequencer: apply out of order now, stage what fails.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sluice_base::hlc::{Range, Time};
use sluice_base::notify::Var;
use sluice_base::stopper::Stopper;

use super::{
    advance_progress, seed_progress, Sequencer, SequencerConfig, StartOptions, Stats,
};
use crate::batches;
use crate::staging::store::StagingStore;
use crate::staging::Stagers;
use crate::types::{Acceptor, TableBatch};

/// Source of "now" for sweep eligibility. [`Time::ZERO`] disables the
/// wall-clock limit, which tests use to make everything sweepable at once.
pub type TimeSource = Arc<dyn Fn() -> Time + Send + Sync>;

fn wall_clock() -> Time {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0);
    Time::new(nanos, 0)
}

/// Applies batches directly when they fall within bounds, falling back to
/// staging on conflict. A background sweep retries the staged backlog.
pub struct BestEffort {
    cfg: SequencerConfig,
    stagers: Arc<Stagers>,
    time_source: Arc<Mutex<TimeSource>>,
}

impl BestEffort {
    pub fn new(cfg: SequencerConfig, stagers: Arc<Stagers>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            stagers,
            time_source: Arc::new(Mutex::new(Arc::new(wall_clock))),
        })
    }

    /// Replaces the clock used to limit sweep eligibility. Takes effect on
    /// the next sweep, even for already-started groups.
    pub fn set_time_source(&self, source: TimeSource) {
        *self.time_source.lock().expect("time source poisoned") = source;
    }
}

#[async_trait]
impl Sequencer for BestEffort {
    async fn start(
        &self,
        ctx: &Stopper,
        opts: &StartOptions,
    ) -> anyhow::Result<(Arc<dyn Acceptor>, Stats)> {
        let stats: Stats = Arc::new(Var::of(seed_progress(&opts.group)));
        let acceptor = Arc::new(BestEffortAcceptor {
            stagers: Arc::clone(&self.stagers),
            store: self.stagers.store(),
            delegate: Arc::clone(&opts.delegate),
            bounds: Arc::clone(&opts.bounds),
            stats: Arc::clone(&stats),
        });

        let sweeper = Sweeper {
            stagers: Arc::clone(&self.stagers),
            store: self.stagers.store(),
            delegate: Arc::clone(&opts.delegate),
            group: opts.group.clone(),
            stats: Arc::clone(&stats),
        };
        let bounds = Arc::clone(&opts.bounds);
        let period = self.cfg.quiescent_period;
        let time_source = Arc::clone(&self.time_source);
        let stopping = ctx.stopping();
        ctx.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let (current, bounds_wake) = bounds.get();
                let source = {
                    let guard = time_source.lock().expect("time source poisoned");
                    Arc::clone(&*guard)
                };
                let now = source();
                let limit = if now.is_zero() {
                    current.max()
                } else {
                    current.max().min(now)
                };
                sweeper.sweep(Range::new(current.min().min(limit), limit)).await;
                tokio::select! {
                    _ = bounds_wake.cancelled() => {}
                    _ = ticker.tick() => {}
                    _ = stopping.cancelled() => return Ok(()),
                }
            }
        });

        Ok((acceptor, stats))
    }
}

struct BestEffortAcceptor {
    stagers: Arc<Stagers>,
    store: Arc<dyn StagingStore>,
    delegate: Arc<dyn Acceptor>,
    bounds: Arc<Var<Range>>,
    stats: Stats,
}

#[async_trait]
impl Acceptor for BestEffortAcceptor {
    async fn accept_table_batch(&self, batch: &TableBatch) -> anyhow::Result<()> {
        if batch.is_empty() {
            advance_progress(&self.stats, batch.time);
            return Ok(());
        }
        anyhow::ensure!(
            !batch.time.is_zero(),
            "mutations must carry a timestamp above zero"
        );
        let stager = self.stagers.get(&batch.table).await?;
        let (bounds, _) = self.bounds.get();
        if bounds.contains(batch.time) {
            match self.delegate.accept_table_batch(batch).await {
                Ok(()) => {
                    // Direct-apply path: record stub rows so replays are
                    // filtered after a restart.
                    stager.mark_applied(&*self.store, &batch.mutations).await?;
                    advance_progress(&self.stats, batch.time);
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(table = %batch.table, %err,
                        "direct apply failed; staging for retry");
                }
            }
        }
        stager.stage(&*self.store, batch.mutations.clone()).await?;
        Ok(())
    }
}

struct Sweeper {
    stagers: Arc<Stagers>,
    store: Arc<dyn StagingStore>,
    delegate: Arc<dyn Acceptor>,
    group: crate::types::TableGroup,
    stats: Stats,
}

impl Sweeper {
    /// Retries the staged backlog. Failures stay staged for the next
    /// sweep; nothing here is fatal.
    async fn sweep(&self, window: Range) {
        if window.is_empty() {
            return;
        }
        let mut clean = true;
        for table in &self.group.tables {
            match self.sweep_table(table, window).await {
                Ok(drained) => clean = clean && drained,
                Err(err) if err_is_schema_missing(&err) => clean = false,
                Err(err) => {
                    clean = false;
                    tracing::debug!(table = %table, %err, "best-effort sweep failed");
                }
            }
        }
        if clean {
            advance_progress(&self.stats, window.max_inclusive());
            for table in &self.group.tables {
                if let Ok(stager) = self.stagers.get(table).await {
                    if let Err(err) = stager.retire(&*self.store, window.max()).await {
                        tracing::debug!(table = %table, %err, "retirement failed");
                    }
                }
            }
        }
    }

    async fn sweep_table(
        &self,
        table: &sluice_base::ident::Table,
        window: Range,
    ) -> anyhow::Result<bool> {
        let stager = self.stagers.get(table).await?;
        loop {
            let rows = stager
                .read_unapplied(&*self.store, window, batches::SIZE)
                .await?;
            if rows.is_empty() {
                return Ok(true);
            }
            let mut progressed = false;
            let mut idx = 0;
            while idx < rows.len() {
                // Batches re-form along timestamp boundaries.
                let time = rows[idx].time;
                let mut end = idx + 1;
                while end < rows.len() && rows[end].time == time {
                    end += 1;
                }
                let batch = TableBatch::new(table.clone(), time, rows[idx..end].to_vec());
                match self.delegate.accept_table_batch(&batch).await {
                    Ok(()) => {
                        stager.mark_applied(&*self.store, &batch.mutations).await?;
                        progressed = true;
                    }
                    Err(err) => {
                        tracing::debug!(table = %table, time = %time, %err,
                            "sweep apply failed; mutations stay staged");
                    }
                }
                idx = end;
            }
            if !progressed {
                return Ok(false);
            }
        }
    }
}

fn err_is_schema_missing(err: &anyhow::Error) -> bool {
    err.downcast_ref::<crate::staging::store::StagingError>()
        .map(|e| e.is_schema_missing())
        .unwrap_or(false)
}
