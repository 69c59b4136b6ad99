//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sluice::script::Document;
use sluice::sequencer::{common_progress, Stats};
use sluice::staging::memory::MemoryStagingStore;
use sluice::staging::{StageConfig, Stagers};
use sluice::types::{Applier, Mutation, TableBatch, TableGroup};
use sluice_base::hlc::Time;
use sluice_base::ident::{Ident, Schema, Table};
use sluice_base::stopper::Stopper;

/// In-memory stand-in for the target database. Applies upserts and deletes
/// keyed by the mutation key, and records every applied `(table, time)`
/// pair for ordering assertions.
#[derive(Default)]
pub struct MemoryTarget {
    tables: Mutex<HashMap<String, BTreeMap<String, Document>>>,
    applied_log: Mutex<Vec<(Table, Time)>>,
}

impl MemoryTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn row_count(&self, table: &Table) -> usize {
        self.tables
            .lock()
            .expect("target poisoned")
            .get(&table.canonical())
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    pub fn count_where(&self, table: &Table, pred: impl Fn(&Document) -> bool) -> usize {
        self.tables
            .lock()
            .expect("target poisoned")
            .get(&table.canonical())
            .map(|rows| rows.values().filter(|doc| pred(doc)).count())
            .unwrap_or(0)
    }

    /// Every `(table, time)` pair applied so far, in apply order.
    pub fn applied_log(&self) -> Vec<(Table, Time)> {
        self.applied_log.lock().expect("target poisoned").clone()
    }
}

#[async_trait]
impl Applier for MemoryTarget {
    async fn apply(&self, batch: &TableBatch) -> anyhow::Result<()> {
        let mut tables = self.tables.lock().expect("target poisoned");
        let rows = tables.entry(batch.table.canonical()).or_default();
        for m in &batch.mutations {
            let key = String::from_utf8_lossy(&m.key).into_owned();
            match &m.data {
                Some(data) => {
                    let doc: Document = serde_json::from_slice(data)?;
                    rows.insert(key, doc);
                }
                None => {
                    rows.remove(&key);
                }
            }
        }
        drop(tables);
        self.applied_log
            .lock()
            .expect("target poisoned")
            .push((batch.table.clone(), batch.time));
        Ok(())
    }
}

/// A stopper, staging store, stager factory, and memory target wired
/// together.
pub struct Fixture {
    pub stop: Stopper,
    pub store: Arc<MemoryStagingStore>,
    pub stagers: Arc<Stagers>,
    pub target: Arc<MemoryTarget>,
    pub schema: Schema,
}

impl Fixture {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
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
        Self {
            stop,
            store,
            stagers,
            target: MemoryTarget::new(),
            schema: Schema::new("public"),
        }
    }

    pub fn group(&self, name: &str, tables: &[&Table]) -> TableGroup {
        TableGroup {
            enclosing: self.schema.clone(),
            name: Ident::new(name),
            tables: tables.iter().map(|t| (*t).clone()).collect(),
        }
    }

    pub async fn shutdown(self) {
        self.stop.stop(Duration::from_secs(1));
        self.stop.wait().await.expect("clean shutdown");
    }
}

pub fn upsert(k: i64, time: Time) -> Mutation {
    Mutation {
        key: Bytes::from(format!("[{k}]").into_bytes()),
        data: Some(Bytes::from(format!(r#"{{"k":{k}}}"#).into_bytes())),
        time,
        ..Mutation::default()
    }
}

pub fn delete(k: i64, time: Time) -> Mutation {
    Mutation {
        key: Bytes::from(format!("[{k}]").into_bytes()),
        time,
        ..Mutation::default()
    }
}

/// Blocks until the group's common progress reaches `end`, asserting that
/// observed progress never regresses.
pub async fn wait_for_progress(stats: &Stats, end: Time) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    let mut last_seen = Time::ZERO;
    loop {
        let (progress, wake) = stats.get();
        let common = common_progress(&progress);
        assert!(common >= last_seen, "progress regressed: {last_seen} -> {common}");
        last_seen = common;
        if common >= end {
            return;
        }
        tokio::select! {
            _ = wake.cancelled() => {}
            _ = tokio::time::sleep_until(deadline) => {
                panic!("timed out waiting for progress {end}, saw {common}");
            }
        }
    }
}
