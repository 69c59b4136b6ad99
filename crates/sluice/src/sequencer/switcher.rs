//! Meta-sequencer that routes a live pipeline between modes.
//!
//! The outgoing mode is drained to quiescence before the incoming mode
//! takes over, so staged work is never abandoned mid-switch. Mode
//! transitions follow the canonical upgrade direction bypass → immediate →
//! serial → shingle → best-effort.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sluice_base::hlc::Time;
use sluice_base::notify::Var;
use sluice_base::stopper::Stopper;
use sluice_base::stopvar;

use super::besteffort::BestEffort;
use super::bypass::Bypass;
use super::immediate::Immediate;
use super::serial::Serial;
use super::shingle::Shingle;
use super::{seed_progress, Progress, Sequencer, SequencerConfig, StartOptions, Stats};
use crate::staging::Stagers;
use crate::types::{Acceptor, TableBatch, TableGroup};

/// The selectable sequencing disciplines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Mode {
    Bypass,
    Immediate,
    Serial,
    Shingle,
    BestEffort,
}

impl Mode {
    pub const MIN: Mode = Mode::Bypass;
    pub const MAX: Mode = Mode::BestEffort;
    pub const ALL: [Mode; 5] = [
        Mode::Bypass,
        Mode::Immediate,
        Mode::Serial,
        Mode::Shingle,
        Mode::BestEffort,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Bypass => "bypass",
            Mode::Immediate => "immediate",
            Mode::Serial => "serial",
            Mode::Shingle => "shingle",
            Mode::BestEffort => "besteffort",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bypass" => Ok(Mode::Bypass),
            "immediate" => Ok(Mode::Immediate),
            "serial" => Ok(Mode::Serial),
            "shingle" => Ok(Mode::Shingle),
            "besteffort" | "best-effort" => Ok(Mode::BestEffort),
            other => anyhow::bail!("unknown sequencer mode {other:?}"),
        }
    }
}

/// The mode-indexed set of base sequencers.
#[derive(Clone)]
struct SequencerSet {
    besteffort: Arc<BestEffort>,
    bypass: Arc<Bypass>,
    immediate: Arc<Immediate>,
    serial: Arc<Serial>,
    shingle: Arc<Shingle>,
}

impl SequencerSet {
    fn get(&self, mode: Mode) -> Arc<dyn Sequencer> {
        match mode {
            Mode::Bypass => Arc::clone(&self.bypass) as Arc<dyn Sequencer>,
            Mode::Immediate => Arc::clone(&self.immediate) as Arc<dyn Sequencer>,
            Mode::Serial => Arc::clone(&self.serial) as Arc<dyn Sequencer>,
            Mode::Shingle => Arc::clone(&self.shingle) as Arc<dyn Sequencer>,
            Mode::BestEffort => Arc::clone(&self.besteffort) as Arc<dyn Sequencer>,
        }
    }
}

/// Routes batches to the sequencer selected by an observable mode.
pub struct Switcher {
    cfg: SequencerConfig,
    stagers: Arc<Stagers>,
    mode: Arc<Var<Mode>>,
    set: SequencerSet,
}

impl Switcher {
    pub fn new(cfg: SequencerConfig, stagers: Arc<Stagers>, mode: Arc<Var<Mode>>) -> Arc<Self> {
        let set = SequencerSet {
            besteffort: BestEffort::new(cfg.clone(), Arc::clone(&stagers)),
            bypass: Bypass::new(),
            immediate: Immediate::new(Arc::clone(&stagers)),
            serial: Serial::new(Arc::clone(&stagers)),
            shingle: Shingle::new(cfg.clone(), Arc::clone(&stagers)),
        };
        Arc::new(Self {
            cfg,
            stagers,
            mode,
            set,
        })
    }

    /// The underlying best-effort sequencer, for time-source injection.
    pub fn best_effort(&self) -> Arc<BestEffort> {
        Arc::clone(&self.set.besteffort)
    }

    /// Waits until the group has no staged backlog, or the quiescent
    /// period elapses.
    async fn quiesce(
        stagers: &Stagers,
        group: &TableGroup,
        quiescent_period: Duration,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + quiescent_period;
        loop {
            let mut backlog = 0i64;
            for table in &group.tables {
                let stager = stagers.get(table).await?;
                backlog += stager
                    .count_unapplied(&*stagers.store(), Time::MAX, false)
                    .await?;
            }
            if backlog == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(backlog, "mode switch proceeding with staged backlog");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Sequencer for Switcher {
    async fn start(
        &self,
        ctx: &Stopper,
        opts: &StartOptions,
    ) -> anyhow::Result<(Arc<dyn Acceptor>, Stats)> {
        let stats_out: Stats = Arc::new(Var::of(seed_progress(&opts.group)));

        // Bring up the initial mode synchronously so the facade never sees
        // an empty slot.
        let (initial, _) = self.mode.get();
        let sub = ctx.child();
        let (acceptor, stats) = self.set.get(initial).start(&sub, opts).await?;
        pipe_stats(&sub, stats, Arc::clone(&stats_out));
        let facade = Arc::new(SwitchingAcceptor {
            current: tokio::sync::RwLock::new(acceptor),
        });

        let mode = Arc::clone(&self.mode);
        let set = self.set.clone();
        let stagers = Arc::clone(&self.stagers);
        let quiescent_period = self.cfg.quiescent_period;
        let opts = opts.clone();
        let facade_task = Arc::clone(&facade);
        let stats_task = Arc::clone(&stats_out);
        let ctx_task = ctx.clone();
        let stopping = ctx.stopping();
        ctx.spawn(async move {
            let mut active_sub = sub;
            let mut active_mode = initial;
            loop {
                let (wanted, wake) = mode.get();
                if wanted != active_mode {
                    tracing::info!(from = %active_mode, to = %wanted, group = %opts.group.name,
                        "switching sequencer mode");
                    // Drain the outgoing mode before rerouting.
                    Self::quiesce(&stagers, &opts.group, quiescent_period).await?;
                    active_sub.stop(Duration::from_secs(1));
                    if let Err(err) = active_sub.wait().await {
                        tracing::warn!(%err, "outgoing sequencer reported an error");
                    }

                    let sub = ctx_task.child();
                    let (acceptor, stats) = set.get(wanted).start(&sub, &opts).await?;
                    pipe_stats(&sub, stats, Arc::clone(&stats_task));
                    *facade_task.current.write().await = acceptor;
                    active_sub = sub;
                    active_mode = wanted;
                }
                tokio::select! {
                    _ = wake.cancelled() => {}
                    _ = stopping.cancelled() => {
                        active_sub.stop(Duration::from_secs(1));
                        return Ok(());
                    }
                }
            }
        });

        Ok((facade, stats_out))
    }
}

struct SwitchingAcceptor {
    current: tokio::sync::RwLock<Arc<dyn Acceptor>>,
}

#[async_trait]
impl Acceptor for SwitchingAcceptor {
    async fn accept_table_batch(&self, batch: &TableBatch) -> anyhow::Result<()> {
        let acceptor = Arc::clone(&*self.current.read().await);
        acceptor.accept_table_batch(batch).await
    }
}

/// Forwards an inner sequencer's progress into the long-lived stats
/// variable, monotonically.
fn pipe_stats(sub: &Stopper, from: Stats, to: Stats) {
    let stop = sub.clone();
    sub.spawn(async move {
        let initial = from.peek();
        merge_progress(&to, &initial);
        stopvar::do_when_changed(&stop, initial, &from, |_, new| {
            let to = Arc::clone(&to);
            async move {
                merge_progress(&to, &new);
                Ok(())
            }
        })
        .await?;
        Ok(())
    });
}

fn merge_progress(to: &Var<Progress>, new: &Progress) {
    to.update(|progress| {
        for (table, time) in new {
            let watermark = progress.entry(table.clone()).or_insert(Time::ZERO);
            if *watermark < *time {
                *watermark = *time;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse_and_roundtrip() {
        for mode in Mode::ALL {
            assert_eq!(mode.as_str().parse::<Mode>().unwrap(), mode);
        }
        assert!("nonsense".parse::<Mode>().is_err());
        assert_eq!(Mode::MIN, Mode::Bypass);
        assert_eq!(Mode::MAX, Mode::BestEffort);
    }

    #[test]
    fn upgrade_direction_is_ordered() {
        let mut prior = None;
        for mode in Mode::ALL {
            if let Some(p) = prior {
                assert!(p < mode, "{p} should sort before {mode}");
            }
            prior = Some(mode);
        }
    }
}
