//! A fully in-memory staging store.
//!
//! Implements the same observable semantics as the SQL-backed store over a
//! mutex-guarded BTreeMap, which keeps rows in `(nanos, logical, key)`
//! order for free. Used for embedded deployments and as the test harness
//! backing store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use sluice_base::hlc::{Range, Time};
use sluice_base::ident::{Schema, Table};

use super::store::{
    code, maybe_decompress, KeyBatch, PackedBatch, StagingError, StagingStore, StagingTxn,
    STUB_SENTINEL,
};
use crate::types::Mutation;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct RowKey {
    nanos: i64,
    logical: i32,
    key: String,
}

impl RowKey {
    fn time(&self) -> Time {
        Time::new(self.nanos, self.logical)
    }

    fn low(t: Time) -> Self {
        Self {
            nanos: t.nanos(),
            logical: t.logical(),
            key: String::new(),
        }
    }
}

#[derive(Clone, Debug)]
struct Row {
    payload: Vec<u8>,
    before: Option<Vec<u8>>,
    applied: bool,
    applied_at: Option<SystemTime>,
    deletion: bool,
}

#[derive(Default)]
struct Shared {
    tables: BTreeMap<String, BTreeMap<RowKey, Row>>,
    checkpoints: BTreeMap<String, (Schema, Time)>,
}

/// In-memory [`StagingStore`].
#[derive(Clone, Default)]
pub struct MemoryStagingStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStagingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total row count in a staging table, for tests and diagnostics.
    pub fn row_count(&self, table: &Table) -> usize {
        let shared = self.lock();
        shared
            .tables
            .get(&table.canonical())
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().expect("staging store poisoned")
    }
}

fn missing_table(table: &str) -> StagingError {
    StagingError::db(
        Some(code::UNDEFINED_TABLE.to_string()),
        format!("staging table {table} does not exist"),
    )
}

fn rows_of<'a>(
    shared: &'a mut Shared,
    table: &str,
) -> Result<&'a mut BTreeMap<RowKey, Row>, StagingError> {
    shared
        .tables
        .get_mut(table)
        .ok_or_else(|| missing_table(table))
}

fn stage_locked(shared: &mut Shared, table: &str, batch: &PackedBatch) -> Result<u64, StagingError> {
    let rows = rows_of(shared, table)?;
    let mut affected = 0u64;
    for idx in 0..batch.len() {
        let key = RowKey {
            nanos: batch.nanos[idx],
            logical: batch.logical[idx],
            key: batch.keys[idx].clone(),
        };
        // ON CONFLICT DO NOTHING.
        rows.entry(key).or_insert_with(|| {
            affected += 1;
            Row {
                payload: batch.muts[idx].clone(),
                before: batch.befores[idx].clone(),
                applied: false,
                applied_at: None,
                deletion: batch.deletions[idx],
            }
        });
    }
    Ok(affected)
}

fn stage_if_exists_locked(
    shared: &mut Shared,
    table: &str,
    batch: &PackedBatch,
) -> Result<Vec<usize>, StagingError> {
    let rows = rows_of(shared, table)?;
    let mut staged = Vec::new();
    for idx in 0..batch.len() {
        let key = &batch.keys[idx];
        let exists = rows.iter().any(|(rk, row)| rk.key == *key && !row.applied);
        if !exists {
            continue;
        }
        staged.push(idx);
        // UPSERT semantics for the qualifying rows.
        rows.insert(
            RowKey {
                nanos: batch.nanos[idx],
                logical: batch.logical[idx],
                key: key.clone(),
            },
            Row {
                payload: batch.muts[idx].clone(),
                before: batch.befores[idx].clone(),
                applied: false,
                applied_at: None,
                deletion: batch.deletions[idx],
            },
        );
    }
    Ok(staged)
}

fn filter_applied_locked(
    shared: &mut Shared,
    table: &str,
    keys: &KeyBatch,
) -> Result<Vec<usize>, StagingError> {
    let rows = rows_of(shared, table)?;
    let mut applied = Vec::new();
    for idx in 0..keys.len() {
        let row_key = RowKey {
            nanos: keys.nanos[idx],
            logical: keys.logical[idx],
            key: keys.keys[idx].clone(),
        };
        if rows.get(&row_key).map(|r| r.applied).unwrap_or(false) {
            applied.push(idx);
        }
    }
    Ok(applied)
}

fn mark_applied_locked(
    shared: &mut Shared,
    table: &str,
    keys: &KeyBatch,
) -> Result<u64, StagingError> {
    let rows = rows_of(shared, table)?;
    let now = SystemTime::now();
    for idx in 0..keys.len() {
        let row_key = RowKey {
            nanos: keys.nanos[idx],
            logical: keys.logical[idx],
            key: keys.keys[idx].clone(),
        };
        let row = rows.entry(row_key).or_insert_with(|| Row {
            payload: STUB_SENTINEL.to_vec(),
            before: None,
            applied: false,
            applied_at: None,
            deletion: false,
        });
        row.applied = true;
        row.applied_at = Some(now);
    }
    Ok(keys.len() as u64)
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn ensure_table(&self, table: &Table) -> Result<(), StagingError> {
        self.lock().tables.entry(table.canonical()).or_default();
        Ok(())
    }

    async fn stage(&self, table: &Table, batch: &PackedBatch) -> Result<u64, StagingError> {
        stage_locked(&mut self.lock(), &table.canonical(), batch)
    }

    async fn stage_if_exists(
        &self,
        table: &Table,
        batch: &PackedBatch,
    ) -> Result<Vec<usize>, StagingError> {
        stage_if_exists_locked(&mut self.lock(), &table.canonical(), batch)
    }

    async fn filter_applied(
        &self,
        table: &Table,
        keys: &KeyBatch,
    ) -> Result<Vec<usize>, StagingError> {
        filter_applied_locked(&mut self.lock(), &table.canonical(), keys)
    }

    async fn mark_applied(&self, table: &Table, keys: &KeyBatch) -> Result<u64, StagingError> {
        mark_applied_locked(&mut self.lock(), &table.canonical(), keys)
    }

    async fn read_unapplied(
        &self,
        table: &Table,
        range: Range,
        limit: usize,
    ) -> Result<Vec<Mutation>, StagingError> {
        let mut shared = self.lock();
        let rows = rows_of(&mut shared, &table.canonical())?;
        let mut out = Vec::new();
        for (row_key, row) in rows.range(RowKey::low(range.min())..RowKey::low(range.max())) {
            if row.applied {
                continue;
            }
            let data = if row.deletion {
                None
            } else {
                Some(Bytes::from(maybe_decompress(&row.payload)?))
            };
            let before = match &row.before {
                Some(b) => Some(Bytes::from(maybe_decompress(b)?)),
                None => None,
            };
            out.push(Mutation {
                key: Bytes::from(row_key.key.clone().into_bytes()),
                data,
                before,
                time: row_key.time(),
                meta: Default::default(),
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn retire_batch(
        &self,
        table: &Table,
        from: Time,
        end: Time,
        limit: i64,
    ) -> Result<Option<Time>, StagingError> {
        let mut shared = self.lock();
        let rows = rows_of(&mut shared, &table.canonical())?;
        let doomed: Vec<RowKey> = rows
            .range(RowKey::low(from)..RowKey::low(end))
            .filter(|(_, row)| row.applied)
            .take(limit.max(0) as usize)
            .map(|(k, _)| k.clone())
            .collect();
        let last = doomed.last().map(|k| k.time());
        for key in doomed {
            rows.remove(&key);
        }
        Ok(last)
    }

    async fn count_unapplied(
        &self,
        table: &Table,
        before: Time,
        _follower_read: bool,
    ) -> Result<i64, StagingError> {
        let mut shared = self.lock();
        let rows = rows_of(&mut shared, &table.canonical())?;
        let count = rows
            .range(..RowKey::low(before))
            .filter(|(_, row)| !row.applied)
            .count();
        Ok(count as i64)
    }

    async fn check_consistency(
        &self,
        table: &Table,
        keys: Option<&[String]>,
        _follower_read: bool,
    ) -> Result<i64, StagingError> {
        let mut shared = self.lock();
        let rows = rows_of(&mut shared, &table.canonical())?;

        // Highest applied timestamp per key.
        let mut applied_max: BTreeMap<&str, Time> = BTreeMap::new();
        for (row_key, row) in rows.iter() {
            if let Some(wanted) = keys {
                if !wanted.contains(&row_key.key) {
                    continue;
                }
            }
            if row.applied {
                let entry = applied_max.entry(&row_key.key).or_insert(Time::ZERO);
                *entry = (*entry).max(row_key.time());
            }
        }

        // Unapplied rows below that watermark violate per-key ordering.
        let mut violations = 0i64;
        for (row_key, row) in rows.iter() {
            if row.applied {
                continue;
            }
            if let Some(max) = applied_max.get(row_key.key.as_str()) {
                if row_key.time() < *max {
                    violations += 1;
                }
            }
        }
        Ok(violations)
    }

    async fn ensure_checkpoints(&self) -> Result<(), StagingError> {
        Ok(())
    }

    async fn write_checkpoint(&self, schema: &Schema, time: Time) -> Result<(), StagingError> {
        let mut shared = self.lock();
        let entry = shared
            .checkpoints
            .entry(schema.canonical())
            .or_insert_with(|| (schema.clone(), Time::ZERO));
        if time > entry.1 {
            entry.1 = time;
        }
        Ok(())
    }

    async fn read_checkpoint(&self, schema: &Schema) -> Result<Option<Time>, StagingError> {
        Ok(self
            .lock()
            .checkpoints
            .get(&schema.canonical())
            .map(|(_, t)| *t))
    }

    async fn scan_checkpoint_schemas(&self) -> Result<Vec<Schema>, StagingError> {
        Ok(self
            .lock()
            .checkpoints
            .values()
            .map(|(schema, _)| schema.clone())
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn StagingTxn>, StagingError> {
        Ok(Box::new(MemoryTxn {
            shared: Arc::clone(&self.shared),
            pending: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

enum Pending {
    Stage(String, PackedBatch),
    MarkApplied(String, KeyBatch),
}

/// Buffering transaction over [`MemoryStagingStore`]. Reads observe
/// committed state; writes land atomically at commit.
pub struct MemoryTxn {
    shared: Arc<Mutex<Shared>>,
    pending: Mutex<Vec<Pending>>,
    closed: AtomicBool,
}

impl MemoryTxn {
    fn check_open(&self) -> Result<(), StagingError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StagingError::TxClosed)
        } else {
            Ok(())
        }
    }

    fn push(&self, op: Pending) {
        self.pending.lock().expect("txn poisoned").push(op);
    }

    fn base(&self) -> MemoryStagingStore {
        MemoryStagingStore {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[async_trait]
impl StagingStore for MemoryTxn {
    async fn ensure_table(&self, table: &Table) -> Result<(), StagingError> {
        self.check_open()?;
        self.base().ensure_table(table).await
    }

    async fn stage(&self, table: &Table, batch: &PackedBatch) -> Result<u64, StagingError> {
        self.check_open()?;
        self.push(Pending::Stage(table.canonical(), batch.clone()));
        Ok(batch.len() as u64)
    }

    async fn stage_if_exists(
        &self,
        table: &Table,
        batch: &PackedBatch,
    ) -> Result<Vec<usize>, StagingError> {
        self.check_open()?;
        self.base().stage_if_exists(table, batch).await
    }

    async fn filter_applied(
        &self,
        table: &Table,
        keys: &KeyBatch,
    ) -> Result<Vec<usize>, StagingError> {
        self.check_open()?;
        self.base().filter_applied(table, keys).await
    }

    async fn mark_applied(&self, table: &Table, keys: &KeyBatch) -> Result<u64, StagingError> {
        self.check_open()?;
        self.push(Pending::MarkApplied(table.canonical(), keys.clone()));
        Ok(keys.len() as u64)
    }

    async fn read_unapplied(
        &self,
        table: &Table,
        range: Range,
        limit: usize,
    ) -> Result<Vec<Mutation>, StagingError> {
        self.check_open()?;
        self.base().read_unapplied(table, range, limit).await
    }

    async fn retire_batch(
        &self,
        table: &Table,
        from: Time,
        end: Time,
        limit: i64,
    ) -> Result<Option<Time>, StagingError> {
        self.check_open()?;
        self.base().retire_batch(table, from, end, limit).await
    }

    async fn count_unapplied(
        &self,
        table: &Table,
        before: Time,
        follower_read: bool,
    ) -> Result<i64, StagingError> {
        self.check_open()?;
        self.base().count_unapplied(table, before, follower_read).await
    }

    async fn check_consistency(
        &self,
        table: &Table,
        keys: Option<&[String]>,
        follower_read: bool,
    ) -> Result<i64, StagingError> {
        self.check_open()?;
        self.base().check_consistency(table, keys, follower_read).await
    }

    async fn ensure_checkpoints(&self) -> Result<(), StagingError> {
        self.check_open()
    }

    async fn write_checkpoint(&self, schema: &Schema, time: Time) -> Result<(), StagingError> {
        self.check_open()?;
        self.base().write_checkpoint(schema, time).await
    }

    async fn read_checkpoint(&self, schema: &Schema) -> Result<Option<Time>, StagingError> {
        self.check_open()?;
        self.base().read_checkpoint(schema).await
    }

    async fn scan_checkpoint_schemas(&self) -> Result<Vec<Schema>, StagingError> {
        self.check_open()?;
        self.base().scan_checkpoint_schemas().await
    }

    async fn begin(&self) -> Result<Box<dyn StagingTxn>, StagingError> {
        Err(StagingError::db(None, "nested staging transactions are not supported"))
    }

    fn in_transaction(&self) -> bool {
        true
    }
}

#[async_trait]
impl StagingTxn for MemoryTxn {
    async fn commit(self: Box<Self>) -> Result<(), StagingError> {
        self.check_open()?;
        self.closed.store(true, Ordering::SeqCst);
        let mut shared = self.shared.lock().expect("staging store poisoned");
        let pending = std::mem::take(&mut *self.pending.lock().expect("txn poisoned"));
        for op in pending {
            match op {
                Pending::Stage(table, batch) => {
                    stage_locked(&mut shared, &table, &batch)?;
                }
                Pending::MarkApplied(table, keys) => {
                    mark_applied_locked(&mut shared, &table, &keys)?;
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StagingError> {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().expect("txn poisoned").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        Schema::new("_staging").table("public_target")
    }

    fn packed(entries: &[(i64, &str)]) -> PackedBatch {
        let mut batch = PackedBatch::with_capacity(entries.len());
        for (nanos, key) in entries {
            batch.nanos.push(*nanos);
            batch.logical.push(0);
            batch.keys.push((*key).to_string());
            batch.muts.push(format!(r#"{{"k":{key}}}"#).into_bytes());
            batch.befores.push(None);
            batch.deletions.push(false);
        }
        batch
    }

    #[tokio::test]
    async fn staging_is_idempotent() {
        let store = MemoryStagingStore::new();
        let t = table();
        store.ensure_table(&t).await.unwrap();

        let batch = packed(&[(1, "[1]"), (2, "[2]")]);
        assert_eq!(store.stage(&t, &batch).await.unwrap(), 2);
        assert_eq!(store.stage(&t, &batch).await.unwrap(), 0, "duplicates ignored");
        assert_eq!(store.row_count(&t), 2);
    }

    #[tokio::test]
    async fn missing_table_reports_sqlstate() {
        let store = MemoryStagingStore::new();
        let err = store.stage(&table(), &packed(&[(1, "[1]")])).await.unwrap_err();
        assert!(err.is_schema_missing());
    }

    #[tokio::test]
    async fn mark_applied_creates_stubs() {
        let store = MemoryStagingStore::new();
        let t = table();
        store.ensure_table(&t).await.unwrap();

        let keys = KeyBatch {
            keys: vec!["[9]".to_string()],
            nanos: vec![5],
            logical: vec![0],
        };
        assert_eq!(store.mark_applied(&t, &keys).await.unwrap(), 1);
        assert_eq!(store.row_count(&t), 1);
        // The stub is applied and therefore invisible to readers.
        let pending = store
            .read_unapplied(&t, Range::including(Time::ZERO, Time::new(10, 0)), 100)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn stage_if_exists_requires_unapplied_row() {
        let store = MemoryStagingStore::new();
        let t = table();
        store.ensure_table(&t).await.unwrap();

        store.stage(&t, &packed(&[(1, "[1]")])).await.unwrap();
        let proposed = packed(&[(2, "[1]"), (2, "[2]")]);
        let staged = store.stage_if_exists(&t, &proposed).await.unwrap();
        assert_eq!(staged, vec![0], "only the existing key is staged");
        assert_eq!(store.row_count(&t), 2);
    }

    #[tokio::test]
    async fn retire_skips_unapplied_rows() {
        let store = MemoryStagingStore::new();
        let t = table();
        store.ensure_table(&t).await.unwrap();

        store.stage(&t, &packed(&[(1, "[1]"), (2, "[2]"), (3, "[3]")])).await.unwrap();
        let keys = KeyBatch {
            keys: vec!["[1]".to_string(), "[3]".to_string()],
            nanos: vec![1, 3],
            logical: vec![0, 0],
        };
        store.mark_applied(&t, &keys).await.unwrap();

        let last = store
            .retire_batch(&t, Time::ZERO, Time::new(10, 0), 1000)
            .await
            .unwrap();
        assert_eq!(last, Some(Time::new(3, 0)));
        assert_eq!(store.row_count(&t), 1, "unapplied row survives");
        assert_eq!(
            store
                .count_unapplied(&t, Time::new(10, 0), false)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn transaction_buffers_until_commit() {
        let store = MemoryStagingStore::new();
        let t = table();
        store.ensure_table(&t).await.unwrap();

        let tx = store.begin().await.unwrap();
        tx.stage(&t, &packed(&[(1, "[1]")])).await.unwrap();
        assert_eq!(store.row_count(&t), 0, "writes invisible before commit");
        tx.commit().await.unwrap();
        assert_eq!(store.row_count(&t), 1);
    }

    #[tokio::test]
    async fn consistency_flags_unapplied_below_applied() {
        let store = MemoryStagingStore::new();
        let t = table();
        store.ensure_table(&t).await.unwrap();

        store.stage(&t, &packed(&[(1, "[1]"), (5, "[1]")])).await.unwrap();
        let keys = KeyBatch {
            keys: vec!["[1]".to_string()],
            nanos: vec![5],
            logical: vec![0],
        };
        store.mark_applied(&t, &keys).await.unwrap();

        assert_eq!(store.check_consistency(&t, None, false).await.unwrap(), 1);
    }
}
