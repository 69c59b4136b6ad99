//! The sequencer family.
//!
//! A sequencer decides when and in what order staged mutations reach the
//! target. Each variant is a factory: [`Sequencer::start`] yields the
//! inbound [`Acceptor`] plus a [`Stats`] variable publishing per-table
//! progress. Progress is group-scoped and monotonic; no variant applies a
//! mutation beyond the bounds variable it was started with.

pub mod besteffort;
pub mod bypass;
pub mod chaos;
pub mod immediate;
pub mod script;
pub mod sequtil;
pub mod serial;
pub mod shingle;
pub mod switcher;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sluice_base::hlc::{Range, Time};
use sluice_base::ident::Table;
use sluice_base::notify::Var;
use sluice_base::stopper::Stopper;

use crate::staging::store::StagingStore;
use crate::staging::Stagers;
use crate::types::{Acceptor, TableBatch, TableGroup};

/// Shared sequencer tuning.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Worker count for sharded draining.
    pub parallelism: usize,
    /// How long the switcher waits for an outgoing mode to drain, and the
    /// cadence of the best-effort sweep.
    pub quiescent_period: Duration,
    /// Probability in `[0, 1)` of an injected failure under the chaos
    /// wrapper.
    pub chaos_probability: f64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            quiescent_period: Duration::from_millis(250),
            chaos_probability: 0.0,
        }
    }
}

impl SequencerConfig {
    pub fn preflight(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.parallelism >= 1, "parallelism must be at least 1");
        anyhow::ensure!(
            self.quiescent_period > Duration::ZERO,
            "quiescent_period must be positive"
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.chaos_probability),
            "chaos_probability must be within [0, 1)"
        );
        Ok(())
    }
}

/// Everything a sequencer needs to begin servicing a table group.
#[derive(Clone)]
pub struct StartOptions {
    /// Staged mutations may be applied only within this range.
    pub bounds: Arc<Var<Range>>,
    /// Receives batches that are ready to land in the target.
    pub delegate: Arc<dyn Acceptor>,
    pub group: TableGroup,
}

/// Last-applied time per target table.
pub type Progress = BTreeMap<Table, Time>;

/// Observable progress, seeded with every group table at [`Time::ZERO`].
pub type Stats = Arc<Var<Progress>>;

/// The timestamp every table of the group has reached.
pub fn common_progress(progress: &Progress) -> Time {
    progress.values().min().copied().unwrap_or(Time::ZERO)
}

pub(crate) fn seed_progress(group: &TableGroup) -> Progress {
    group
        .tables
        .iter()
        .map(|t| (t.clone(), Time::ZERO))
        .collect()
}

/// Advances every table of the group to at least `time`. Ordering is
/// group-scoped, so a fully-processed batch moves the whole group.
pub(crate) fn advance_progress(stats: &Var<Progress>, time: Time) {
    stats.update(|progress| {
        for watermark in progress.values_mut() {
            if *watermark < time {
                *watermark = time;
            }
        }
    });
}

/// For variants that apply synchronously in arrival order: everything
/// accepted has landed by the time `accept_table_batch` returns, so the
/// resolved edge itself is a progress floor.
pub(crate) fn follow_bounds(
    ctx: &Stopper,
    bounds: Arc<Var<Range>>,
    stats: Stats,
) {
    let stop = ctx.clone();
    ctx.spawn(async move {
        sluice_base::stopvar::do_when_changed(&stop, Range::empty(), &bounds, |_, new| {
            let stats = Arc::clone(&stats);
            async move {
                advance_progress(&stats, new.max_inclusive());
                Ok(())
            }
        })
        .await?;
        Ok(())
    });
}

/// A factory for per-group processing pipelines.
#[async_trait]
pub trait Sequencer: Send + Sync {
    async fn start(
        &self,
        ctx: &Stopper,
        opts: &StartOptions,
    ) -> anyhow::Result<(Arc<dyn Acceptor>, Stats)>;
}

/// Inbound face shared by the staging variants: persist the batch, then
/// nudge the drain workers.
pub(crate) struct StagingAcceptor {
    pub(crate) stagers: Arc<Stagers>,
    pub(crate) store: Arc<dyn StagingStore>,
    pub(crate) dirty: Arc<Var<u64>>,
}

#[async_trait]
impl Acceptor for StagingAcceptor {
    async fn accept_table_batch(&self, batch: &TableBatch) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        anyhow::ensure!(
            !batch.time.is_zero(),
            "mutations must carry a timestamp above zero"
        );
        let stager = self.stagers.get(&batch.table).await?;
        stager.stage(&*self.store, batch.mutations.clone()).await?;
        self.dirty.update(|n| *n = n.wrapping_add(1));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_base::ident::Schema;

    #[test]
    fn common_progress_is_the_minimum() {
        let schema = Schema::new("s");
        let mut progress = Progress::new();
        progress.insert(schema.table("a"), Time::new(5, 0));
        progress.insert(schema.table("b"), Time::new(3, 0));
        assert_eq!(common_progress(&progress), Time::new(3, 0));
        assert_eq!(common_progress(&Progress::new()), Time::ZERO);
    }

    #[test]
    fn preflight_rejects_bad_config() {
        let mut cfg = SequencerConfig::default();
        assert!(cfg.preflight().is_ok());
        cfg.parallelism = 0;
        assert!(cfg.preflight().is_err());

        let mut cfg = SequencerConfig::default();
        cfg.quiescent_period = Duration::ZERO;
        assert!(cfg.preflight().is_err());

        let mut cfg = SequencerConfig::default();
        cfg.chaos_probability = 1.5;
        assert!(cfg.preflight().is_err());
    }

    #[test]
    fn progress_advances_monotonically() {
        let schema = Schema::new("s");
        let group = TableGroup {
            enclosing: schema.clone(),
            name: sluice_base::ident::Ident::new("g"),
            tables: vec![schema.table("a"), schema.table("b")],
        };
        let stats = Var::of(seed_progress(&group));
        advance_progress(&stats, Time::new(5, 0));
        advance_progress(&stats, Time::new(3, 0));
        let progress = stats.peek();
        assert!(progress.values().all(|t| *t == Time::new(5, 0)));
    }
}
