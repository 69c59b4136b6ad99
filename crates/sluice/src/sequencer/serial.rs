//! Strict-order sequencer: a single worker per group drains staged rows in
//! `(nanos, logical, key)` order up to the current bounds.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sluice_base::hlc::{Range, Time};
use sluice_base::ident::Table;
use sluice_base::notify::Var;
use sluice_base::stopper::Stopper;

use super::{
    advance_progress, seed_progress, Sequencer, StagingAcceptor, StartOptions, Stats,
};
use crate::batches;
use crate::staging::store::StagingStore;
use crate::staging::Stagers;
use crate::types::{Acceptor, Mutation, TableBatch, TableGroup};

/// Stages everything; a single worker applies in strict HLC order.
pub struct Serial {
    stagers: Arc<Stagers>,
}

impl Serial {
    pub fn new(stagers: Arc<Stagers>) -> Arc<Self> {
        Arc::new(Self { stagers })
    }
}

#[async_trait]
impl Sequencer for Serial {
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

        let drainer = Drainer {
            stagers: Arc::clone(&self.stagers),
            store: self.stagers.store(),
            delegate: Arc::clone(&opts.delegate),
            group: opts.group.clone(),
            shard: None,
        };
        let bounds = Arc::clone(&opts.bounds);
        let worker_stats = Arc::clone(&stats);
        let stopping = ctx.stopping();
        ctx.spawn(async move {
            loop {
                let (current, bounds_wake) = bounds.get();
                let (_, dirty_wake) = dirty.get();
                if drainer.drain(current).await? {
                    advance_progress(&worker_stats, current.max_inclusive());
                    drainer.retire(current.max()).await?;
                    tokio::select! {
                        _ = bounds_wake.cancelled() => {}
                        _ = dirty_wake.cancelled() => {}
                        _ = stopping.cancelled() => return Ok(()),
                    }
                } else {
                    // Blocked behind rows another worker owns; poll again
                    // shortly.
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
                        _ = stopping.cancelled() => return Ok(()),
                    }
                }
            }
        });

        Ok((acceptor, stats))
    }
}

/// Drains staged rows within bounds and applies them through the delegate.
/// Shared by the serial and shingle variants; the latter restricts each
/// worker to a key-hash shard.
pub(crate) struct Drainer {
    pub(crate) stagers: Arc<Stagers>,
    pub(crate) store: Arc<dyn StagingStore>,
    pub(crate) delegate: Arc<dyn Acceptor>,
    pub(crate) group: TableGroup,
    /// `(index, count)` restricting this drainer to one key-hash shard.
    pub(crate) shard: Option<(usize, usize)>,
}

impl Drainer {
    /// Applies and marks staged rows below the bounds. Returns true once
    /// everything within bounds has been applied.
    pub(crate) async fn drain(&self, bounds: Range) -> anyhow::Result<bool> {
        if bounds.is_empty() {
            // Nothing is eligible yet; wait for the resolver.
            return Ok(true);
        }
        loop {
            // Page unapplied rows per table; a full page means there may be
            // more behind it, so only rows below the page's last timestamp
            // are safe to apply in global order.
            let mut pending: Vec<(Table, Mutation)> = Vec::new();
            let mut cutoff: Option<Time> = None;
            for table in &self.group.tables {
                let stager = self.stagers.get(table).await?;
                let rows = stager
                    .read_unapplied(&*self.store, bounds, batches::SIZE)
                    .await?;
                if rows.len() == batches::SIZE {
                    let last = rows[rows.len() - 1].time;
                    cutoff = Some(cutoff.map_or(last, |c: Time| c.min(last)));
                }
                for m in rows {
                    if let Some((index, count)) = self.shard {
                        if shard_of(&m.key, count) != index {
                            continue;
                        }
                    }
                    pending.push((table.clone(), m));
                }
            }
            if pending.is_empty() {
                // With no cutoff the range is fully applied. Otherwise the
                // saturated pages belong to other shards; report "not yet"
                // so the caller polls again once their owners consume them.
                return Ok(cutoff.is_none());
            }

            pending.sort_by(|a, b| (a.1.time, &a.1.key).cmp(&(b.1.time, &b.1.key)));
            let min_time = pending[0].1.time;
            let eligible_end = match cutoff {
                Some(c) if c > min_time => c,
                // An entire page at one timestamp; take that timestamp now
                // and pick up the remainder on the next pass.
                Some(_) => min_time.next(),
                None => bounds.max(),
            };

            let mut by_time: BTreeMap<Time, BTreeMap<Table, Vec<Mutation>>> = BTreeMap::new();
            for (table, m) in pending {
                if m.time >= eligible_end {
                    continue;
                }
                by_time.entry(m.time).or_default().entry(table).or_default().push(m);
            }

            for (time, tables) in by_time {
                for (table, muts) in tables {
                    let stager = self.stagers.get(&table).await?;
                    let batch = TableBatch::new(table, time, muts);
                    self.delegate.accept_table_batch(&batch).await?;
                    stager.mark_applied(&*self.store, &batch.mutations).await?;
                }
            }
        }
    }

    /// Deletes applied rows below the resolved bound.
    pub(crate) async fn retire(&self, upto: Time) -> anyhow::Result<()> {
        for table in &self.group.tables {
            let stager = self.stagers.get(table).await?;
            stager.retire(&*self.store, upto).await?;
        }
        Ok(())
    }
}

pub(crate) fn shard_of(key: &[u8], count: usize) -> usize {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % count.max(1) as u64) as usize
}
