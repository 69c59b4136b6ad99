//! Durable staging of pending mutations, one staging table per target
//! table.
//!
//! A [`Stager`] owns the staging table for a single target and exposes the
//! stage / filter / mark-applied / retire lifecycle. The [`Stagers`] factory
//! hands out one instance per target table, bootstrapping the staging
//! schema on first use and attaching the periodic observability loops.

pub mod memory;
pub mod sql;
pub mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sluice_base::hlc::{Range, Time};
use sluice_base::ident::{Schema, Table};
use sluice_base::notify::Var;
use sluice_base::stopper::Stopper;

use crate::types::Mutation;
use crate::{batches, msort, retry};
use store::{KeyBatch, PackedBatch, StagingError, StagingStore};

/// Tuning for the staging lifecycle.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Batch size for mark-applied statements; batches above this size are
    /// wrapped in a staging transaction so their apply times land
    /// atomically.
    pub mark_applied_limit: usize,
    /// Cadence of the stale-mutation gauge. Zero disables the loop.
    pub unapplied_period: Duration,
    /// Cadence of the consistency audit. Zero disables the loop.
    pub sanity_check_period: Duration,
    /// Row cap per retirement delete, bounding transaction size.
    pub retire_limit: i64,
    /// Forces mark-applied into a transaction and audits the touched keys.
    pub extra_sanity_checks: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            mark_applied_limit: 10_000,
            unapplied_period: Duration::from_secs(60),
            sanity_check_period: Duration::ZERO,
            retire_limit: 10_000,
            extra_sanity_checks: false,
        }
    }
}

impl StageConfig {
    pub fn preflight(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.mark_applied_limit >= 1, "mark_applied_limit must be at least 1");
        anyhow::ensure!(self.retire_limit >= 1, "retire_limit must be at least 1");
        Ok(())
    }
}

/// Hot-path staging counters. Gauges are written by the background loops.
#[derive(Debug, Default)]
pub struct StageMetrics {
    staged: AtomicU64,
    dupes: AtomicU64,
    filtered: AtomicU64,
    marked: AtomicU64,
    retire_errors: AtomicU64,
    stale: AtomicU64,
    consistency_errors: AtomicU64,
}

/// Point-in-time copy of [`StageMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageMetricsSnapshot {
    pub staged: u64,
    pub dupes: u64,
    pub filtered: u64,
    pub marked: u64,
    pub retire_errors: u64,
    pub stale: u64,
    pub consistency_errors: u64,
}

impl StageMetrics {
    pub fn snapshot(&self) -> StageMetricsSnapshot {
        StageMetricsSnapshot {
            staged: self.staged.load(Ordering::Relaxed),
            dupes: self.dupes.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            marked: self.marked.load(Ordering::Relaxed),
            retire_errors: self.retire_errors.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            consistency_errors: self.consistency_errors.load(Ordering::Relaxed),
        }
    }
}

/// Transposes mutations into parallel arrays, fanning the CPU-bound work
/// (JSON handling plus compression) across the available cores.
pub fn pack(muts: &[Mutation]) -> Result<PackedBatch, StagingError> {
    let n = muts.len();
    let mut batch = PackedBatch {
        nanos: vec![0; n],
        logical: vec![0; n],
        keys: vec![String::new(); n],
        muts: vec![Vec::new(); n],
        befores: vec![None; n],
        deletions: vec![false; n],
    };
    if n == 0 {
        return Ok(batch);
    }

    let workers = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
        .min(n);
    let chunk = n.div_ceil(workers);

    std::thread::scope(|scope| -> Result<(), StagingError> {
        let mut handles = Vec::with_capacity(workers);
        let iter = muts
            .chunks(chunk)
            .zip(batch.nanos.chunks_mut(chunk))
            .zip(batch.logical.chunks_mut(chunk))
            .zip(batch.keys.chunks_mut(chunk))
            .zip(batch.muts.chunks_mut(chunk))
            .zip(batch.befores.chunks_mut(chunk))
            .zip(batch.deletions.chunks_mut(chunk));
        for ((((((src, nanos), logical), keys), payloads), befores), deletions) in iter {
            handles.push(scope.spawn(move || -> Result<(), StagingError> {
                for (idx, m) in src.iter().enumerate() {
                    nanos[idx] = m.time.nanos();
                    logical[idx] = m.time.logical();
                    keys[idx] = String::from_utf8_lossy(&m.key).into_owned();
                    deletions[idx] = m.is_delete();
                    if let Some(before) = &m.before {
                        befores[idx] = Some(store::maybe_compress(before)?);
                    }
                    payloads[idx] = match &m.data {
                        Some(data) => store::maybe_compress(data)?,
                        None => b"null".to_vec(),
                    };
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle.join().expect("packing worker panicked")?;
        }
        Ok(())
    })?;
    Ok(batch)
}

/// Storage and retrieval of pending mutations for one target table.
pub struct Stager {
    cfg: StageConfig,
    target: Table,
    staging: Table,
    stop: Stopper,
    retire_from: Var<Time>,
    metrics: StageMetrics,
}

impl Stager {
    pub fn target(&self) -> &Table {
        &self.target
    }

    /// The staging table backing this stager.
    pub fn staging_table(&self) -> &Table {
        &self.staging
    }

    pub fn metrics(&self) -> StageMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Upsert-ignore of the mutations into the staging table. Idempotent;
    /// duplicates are counted, never errored. Batches run concurrently
    /// unless the handle is a transaction.
    pub async fn stage(
        &self,
        db: &dyn StagingStore,
        muts: Vec<Mutation>,
    ) -> Result<(), StagingError> {
        let muts = msort::unique_by_time_key(muts);
        let total = muts.len();
        if total == 0 {
            return Ok(());
        }

        let packed = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            batches::batch::<StagingError>(muts.len(), |begin, end| {
                out.push(pack(&muts[begin..end])?);
                Ok(())
            })?;
            Ok::<_, StagingError>(out)
        })
        .await
        .map_err(|join| StagingError::db(None, format!("packing task failed: {join}")))??;

        let mut affected = 0u64;
        if db.in_transaction() {
            for batch in &packed {
                affected += db.stage(&self.staging, batch).await?;
            }
        } else {
            // A pool-style handle admits concurrent batches.
            use futures_util::stream::{FuturesUnordered, StreamExt};
            let mut inflight: FuturesUnordered<_> = packed
                .iter()
                .map(|batch| retry::retry(&self.stop, move || db.stage(&self.staging, batch)))
                .collect();
            while let Some(result) = inflight.next().await {
                affected += result?;
            }
        }

        // Changefeeds guarantee at-least-once delivery, so a small number of
        // re-deliveries is normal.
        let dupes = total as u64 - affected;
        self.metrics.staged.fetch_add(affected, Ordering::Relaxed);
        self.metrics.dupes.fetch_add(dupes, Ordering::Relaxed);
        tracing::debug!(count = total, dupes, target = %self.target, "staged mutations");
        Ok(())
    }

    /// Stages mutations whose keys already have an unapplied row, returning
    /// the mutations that were not staged.
    pub async fn stage_if_exists(
        &self,
        db: &dyn StagingStore,
        muts: &[Mutation],
    ) -> Result<Vec<Mutation>, StagingError> {
        if muts.is_empty() {
            return Ok(Vec::new());
        }
        let packed = pack(muts)?;
        let staged = db.stage_if_exists(&self.staging, &packed).await?;
        let staged: std::collections::HashSet<usize> = staged.into_iter().collect();
        // Return a fresh vector so callers can re-use their input.
        Ok(muts
            .iter()
            .enumerate()
            .filter(|(idx, _)| !staged.contains(idx))
            .map(|(_, m)| m.clone())
            .collect())
    }

    /// Returns the subset of `muts` not yet marked applied, preserving
    /// input order.
    pub async fn filter_applied(
        &self,
        db: &dyn StagingStore,
        muts: &[Mutation],
    ) -> Result<Vec<Mutation>, StagingError> {
        if muts.is_empty() {
            return Ok(Vec::new());
        }
        let keys = KeyBatch::from_mutations(muts);
        let applied = db.filter_applied(&self.staging, &keys).await?;
        if applied.is_empty() {
            // Typical case: nothing was applied, hand back a plain copy.
            return Ok(muts.to_vec());
        }
        let applied: std::collections::HashSet<usize> = applied.into_iter().collect();
        self.metrics
            .filtered
            .fetch_add(applied.len() as u64, Ordering::Relaxed);
        Ok(muts
            .iter()
            .enumerate()
            .filter(|(idx, _)| !applied.contains(idx))
            .map(|(_, m)| m.clone())
            .collect())
    }

    /// Marks the mutations applied, creating stub rows for mutations that
    /// were applied without ever being staged.
    pub async fn mark_applied(
        &self,
        db: &dyn StagingStore,
        muts: &[Mutation],
    ) -> Result<(), StagingError> {
        if muts.is_empty() {
            return Ok(());
        }
        let keys = KeyBatch::from_mutations(muts);
        let keys = &keys;
        let total = muts.len();
        retry::retry(&self.stop, || async move {
            let want_txn = self.cfg.extra_sanity_checks || total > self.cfg.mark_applied_limit;
            let mut marked = 0u64;
            if want_txn && !db.in_transaction() {
                let txn = db.begin().await?;
                batched_mark(&*txn, &self.staging, keys, self.cfg.mark_applied_limit, &mut marked)
                    .await?;
                if self.cfg.extra_sanity_checks {
                    self.audit_keys(&*txn, keys).await?;
                }
                txn.commit().await?;
            } else {
                batched_mark(db, &self.staging, keys, self.cfg.mark_applied_limit, &mut marked)
                    .await?;
                if self.cfg.extra_sanity_checks {
                    self.audit_keys(db, keys).await?;
                }
            }
            self.metrics.marked.fetch_add(marked, Ordering::Relaxed);
            Ok(())
        })
        .await
    }

    async fn audit_keys(&self, db: &dyn StagingStore, keys: &KeyBatch) -> Result<(), StagingError> {
        let count = db
            .check_consistency(&self.staging, Some(keys.keys.as_slice()), false)
            .await?;
        if count != 0 {
            return Err(StagingError::db(
                None,
                format!("consistency check failed for {count} mutations"),
            ));
        }
        Ok(())
    }

    /// Deletes applied rows below `end` in bounded batches, advancing the
    /// per-stager high-water mark so later calls skip already-swept ranges.
    pub async fn retire(&self, db: &dyn StagingStore, end: Time) -> Result<(), StagingError> {
        let result = retry::retry(&self.stop, || async move {
            let (mut from, _) = self.retire_from.get();
            while from < end {
                match db
                    .retire_batch(&self.staging, from, end, self.cfg.retire_limit)
                    .await?
                {
                    Some(last) => from = last.next(),
                    None => break,
                }
            }
            // Even when nothing qualified, the scanned range is done.
            if from < end {
                from = end;
            }
            self.retire_from.set(from);
            Ok(())
        })
        .await;
        if result.is_err() {
            self.metrics.retire_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Count of unapplied mutations below `before`. With `follower_read`
    /// the staging database may serve a slightly stale answer.
    pub async fn count_unapplied(
        &self,
        db: &dyn StagingStore,
        before: Time,
        follower_read: bool,
    ) -> Result<i64, StagingError> {
        db.count_unapplied(&self.staging, before, follower_read).await
    }

    /// Unapplied mutations within `range`, oldest first.
    pub async fn read_unapplied(
        &self,
        db: &dyn StagingStore,
        range: Range,
        limit: usize,
    ) -> Result<Vec<Mutation>, StagingError> {
        db.read_unapplied(&self.staging, range, limit).await
    }

    /// Per-key ordering audit. Returns the number of violations.
    pub async fn check_consistency(
        &self,
        db: &dyn StagingStore,
        keys: Option<&[String]>,
        follower_read: bool,
    ) -> Result<i64, StagingError> {
        db.check_consistency(&self.staging, keys, follower_read).await
    }
}

async fn batched_mark(
    db: &dyn StagingStore,
    table: &Table,
    keys: &KeyBatch,
    limit: usize,
    marked: &mut u64,
) -> Result<(), StagingError> {
    // Sliced to stay under the staging database's read-buffer limit and to
    // bound memory when marking millions of rows.
    let mut windows = Vec::new();
    batches::window::<StagingError>(limit, keys.len(), |begin, end| {
        windows.push(keys.slice(begin, end));
        Ok(())
    })?;
    for window in &windows {
        *marked += db.mark_applied(table, window).await?;
    }
    Ok(())
}

/// Hands out the [`Stager`] for each target table, creating staging tables
/// on demand.
pub struct Stagers {
    cfg: StageConfig,
    staging_schema: Schema,
    store: Arc<dyn StagingStore>,
    stop: Stopper,
    instances: tokio::sync::RwLock<HashMap<String, Arc<Stager>>>,
}

impl Stagers {
    pub fn new(
        stop: &Stopper,
        store: Arc<dyn StagingStore>,
        staging_schema: Schema,
        cfg: StageConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            staging_schema,
            store,
            stop: stop.clone(),
            instances: tokio::sync::RwLock::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> Arc<dyn StagingStore> {
        Arc::clone(&self.store)
    }

    /// The stager for `target`, created (with schema bootstrap) on first
    /// use.
    pub async fn get(&self, target: &Table) -> Result<Arc<Stager>, StagingError> {
        let key = target.canonical();
        if let Some(found) = self.instances.read().await.get(&key) {
            return Ok(Arc::clone(found));
        }

        let mut instances = self.instances.write().await;
        if let Some(found) = instances.get(&key) {
            return Ok(Arc::clone(found));
        }

        let staging = self.staging_schema.table(target.mangled('_'));
        self.store.ensure_table(&staging).await?;

        let stager = Arc::new(Stager {
            cfg: self.cfg.clone(),
            target: target.clone(),
            staging,
            stop: self.stop.clone(),
            retire_from: Var::of(Time::ZERO),
            metrics: StageMetrics::default(),
        });
        self.start_background(&stager);
        instances.insert(key, Arc::clone(&stager));
        Ok(stager)
    }

    /// Attaches the periodic unapplied-count gauge and consistency audit.
    /// Both swallow schema-missing errors so startup and teardown stay
    /// quiet.
    fn start_background(&self, stager: &Arc<Stager>) {
        if self.cfg.unapplied_period > Duration::ZERO {
            let stager = Arc::clone(stager);
            let store = Arc::clone(&self.store);
            let period = self.cfg.unapplied_period;
            let stopping = self.stop.stopping();
            self.stop.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    // Read without subscribing: the retire mark may churn at
                    // a high rate on the instance holding the resolver
                    // lease.
                    let (from, _) = stager.retire_from.get();
                    match stager.count_unapplied(&*store, from, true).await {
                        Ok(count) => {
                            stager.metrics.stale.store(count as u64, Ordering::Relaxed);
                        }
                        Err(err) if err.is_schema_missing() => {}
                        Err(err) => {
                            tracing::warn!(target = %stager.target, %err,
                                "could not count unapplied mutations");
                        }
                    }
                    tokio::select! {
                        _ = stopping.cancelled() => return Ok(()),
                        _ = ticker.tick() => {}
                    }
                }
            });
        }

        if self.cfg.sanity_check_period > Duration::ZERO {
            let stager = Arc::clone(stager);
            let store = Arc::clone(&self.store);
            let period = self.cfg.sanity_check_period;
            let stopping = self.stop.stopping();
            self.stop.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    match stager.check_consistency(&*store, None, true).await {
                        Ok(count) => {
                            stager
                                .metrics
                                .consistency_errors
                                .store(count as u64, Ordering::Relaxed);
                            if count != 0 {
                                tracing::warn!(target = %stager.target, count,
                                    "staging consistency violations detected");
                            }
                        }
                        Err(err) if err.is_schema_missing() => {}
                        Err(err) => {
                            tracing::warn!(target = %stager.target, %err,
                                "could not check staging consistency");
                        }
                    }
                    tokio::select! {
                        _ = stopping.cancelled() => return Ok(()),
                        _ = ticker.tick() => {}
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::memory::MemoryStagingStore;
    use bytes::Bytes;

    fn mutation(k: i64, time: Time) -> Mutation {
        Mutation {
            key: Bytes::from(format!("[{k}]").into_bytes()),
            data: Some(Bytes::from(format!(r#"{{"k":{k}}}"#).into_bytes())),
            time,
            ..Mutation::default()
        }
    }

    async fn fixture() -> (Stopper, Arc<MemoryStagingStore>, Arc<Stager>) {
        let stop = Stopper::new();
        let store = MemoryStagingStore::new();
        let stagers = Stagers::new(
            &stop,
            store.clone(),
            Schema::new("_staging"),
            StageConfig {
                unapplied_period: Duration::ZERO,
                sanity_check_period: Duration::ZERO,
                ..StageConfig::default()
            },
        );
        let target = Schema::new("public").table("target");
        let stager = stagers.get(&target).await.expect("stager");
        (stop, store, stager)
    }

    #[tokio::test]
    async fn stage_is_idempotent_and_counts_dupes() {
        let (_stop, store, stager) = fixture().await;
        let muts: Vec<Mutation> = (0..10).map(|k| mutation(k, Time::new(k + 1, 0))).collect();

        stager.stage(&*store, muts.clone()).await.expect("stage");
        assert_eq!(store.row_count(stager.staging_table()), 10);
        assert_eq!(stager.metrics().dupes, 0);

        stager.stage(&*store, muts).await.expect("restage");
        assert_eq!(store.row_count(stager.staging_table()), 10, "row count stable");
        assert_eq!(stager.metrics().dupes, 10);
    }

    #[tokio::test]
    async fn stage_collapses_duplicate_time_keys() {
        let (_stop, store, stager) = fixture().await;
        let t = Time::new(1, 0);
        let mut dupe = mutation(1, t);
        dupe.data = Some(Bytes::from_static(br#"{"k":1,"v":"winner"}"#));
        stager
            .stage(&*store, vec![mutation(1, t), dupe])
            .await
            .expect("stage");
        assert_eq!(store.row_count(stager.staging_table()), 1);

        let rows = stager
            .read_unapplied(&*store, Range::including(Time::ZERO, t), 10)
            .await
            .expect("read");
        assert_eq!(rows[0].data.as_deref(), Some(&br#"{"k":1,"v":"winner"}"#[..]));
    }

    #[tokio::test]
    async fn filter_applied_preserves_order() {
        let (_stop, store, stager) = fixture().await;
        let muts: Vec<Mutation> = (0..6).map(|k| mutation(k, Time::new(k + 1, 0))).collect();
        stager.stage(&*store, muts.clone()).await.expect("stage");

        // Nothing applied: the result is a plain copy.
        let pending = stager.filter_applied(&*store, &muts).await.expect("filter");
        assert_eq!(pending, muts);

        let applied = vec![muts[1].clone(), muts[4].clone()];
        stager.mark_applied(&*store, &applied).await.expect("mark");

        let pending = stager.filter_applied(&*store, &muts).await.expect("filter");
        let expect: Vec<Mutation> = vec![
            muts[0].clone(),
            muts[2].clone(),
            muts[3].clone(),
            muts[5].clone(),
        ];
        assert_eq!(pending, expect, "order of unapplied mutations preserved");
    }

    #[tokio::test]
    async fn retire_never_deletes_unapplied() {
        let (_stop, store, stager) = fixture().await;
        let muts: Vec<Mutation> = (0..10).map(|k| mutation(k, Time::new(k + 1, 0))).collect();
        stager.stage(&*store, muts.clone()).await.expect("stage");
        stager.mark_applied(&*store, &muts[..5]).await.expect("mark");

        let end = Time::new(100, 0);
        stager.retire(&*store, end).await.expect("retire");
        assert_eq!(store.row_count(stager.staging_table()), 5);
        assert_eq!(
            stager.count_unapplied(&*store, end, false).await.expect("count"),
            5
        );

        // Repeated retirement starts from the high-water mark and stays
        // a no-op until more rows are applied.
        stager.retire(&*store, end).await.expect("retire again");
        assert_eq!(store.row_count(stager.staging_table()), 5);
    }

    #[tokio::test]
    async fn mark_applied_windows_large_batches() {
        let stop = Stopper::new();
        let store = MemoryStagingStore::new();
        let stagers = Stagers::new(
            &stop,
            store.clone(),
            Schema::new("_staging"),
            StageConfig {
                mark_applied_limit: 3,
                unapplied_period: Duration::ZERO,
                sanity_check_period: Duration::ZERO,
                ..StageConfig::default()
            },
        );
        let target = Schema::new("public").table("target");
        let stager = stagers.get(&target).await.expect("stager");

        let muts: Vec<Mutation> = (0..10).map(|k| mutation(k, Time::new(k + 1, 0))).collect();
        stager.stage(&*store, muts.clone()).await.expect("stage");
        stager.mark_applied(&*store, &muts).await.expect("mark");
        assert_eq!(
            stager
                .count_unapplied(&*store, Time::new(100, 0), false)
                .await
                .expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn stage_if_exists_returns_rejects() {
        let (_stop, store, stager) = fixture().await;
        stager
            .stage(&*store, vec![mutation(1, Time::new(1, 0))])
            .await
            .expect("stage");

        let proposed = vec![mutation(1, Time::new(2, 0)), mutation(2, Time::new(2, 0))];
        let rejected = stager
            .stage_if_exists(&*store, &proposed)
            .await
            .expect("stage if exists");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].key, proposed[1].key);
    }

    #[tokio::test]
    async fn extra_sanity_checks_flag_bad_marks() {
        let stop = Stopper::new();
        let store = MemoryStagingStore::new();
        let stagers = Stagers::new(
            &stop,
            store.clone(),
            Schema::new("_staging"),
            StageConfig {
                extra_sanity_checks: true,
                unapplied_period: Duration::ZERO,
                sanity_check_period: Duration::ZERO,
                ..StageConfig::default()
            },
        );
        let target = Schema::new("public").table("target");
        let stager = stagers.get(&target).await.expect("stager");

        let old = mutation(1, Time::new(1, 0));
        let new = mutation(1, Time::new(5, 0));
        stager
            .stage(&*store, vec![old, new.clone()])
            .await
            .expect("stage");

        // Marking the newer row while the older one is pending violates
        // per-key ordering and must be refused.
        let err = stager.mark_applied(&*store, &[new]).await.expect_err("audit");
        assert!(err.to_string().contains("consistency"), "got: {err}");
    }

    #[test]
    fn pack_transposes_and_flags_deletions() {
        let mut del = mutation(2, Time::new(2, 1));
        del.data = None;
        let muts = vec![mutation(1, Time::new(1, 0)), del];
        let packed = pack(&muts).expect("pack");
        assert_eq!(packed.len(), 2);
        assert_eq!(packed.nanos, vec![1, 2]);
        assert_eq!(packed.logical, vec![0, 1]);
        assert_eq!(packed.keys, vec!["[1]".to_string(), "[2]".to_string()]);
        assert_eq!(packed.deletions, vec![false, true]);
        assert_eq!(packed.muts[1], b"null".to_vec());
    }
}
