//! Core data model shared by the staging and sequencing layers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use sluice_base::hlc::Time;
use sluice_base::ident::{Ident, Schema, Table};

/// A single row mutation captured from the source.
///
/// `data == None` denotes a deletion. The key is a JSON-encoded vector of
/// primary-key values and is never empty for ingested mutations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mutation {
    pub key: Bytes,
    pub data: Option<Bytes>,
    pub before: Option<Bytes>,
    pub time: Time,
    pub meta: Map<String, Value>,
}

impl Mutation {
    pub fn is_delete(&self) -> bool {
        self.data.is_none()
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }
}

/// A group of mutations for one table, all sharing the same timestamp.
#[derive(Clone, Debug)]
pub struct TableBatch {
    pub table: Table,
    pub time: Time,
    pub mutations: Vec<Mutation>,
}

impl TableBatch {
    pub fn new(table: Table, time: Time, mutations: Vec<Mutation>) -> Self {
        Self {
            table,
            time,
            mutations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

impl fmt::Display for TableBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({} muts)", self.table, self.time, self.mutations.len())
    }
}

/// A named set of target tables that share ordering, a sequencer instance,
/// and a resolved-timestamp checkpoint.
#[derive(Clone, Debug)]
pub struct TableGroup {
    pub enclosing: Schema,
    pub name: Ident,
    pub tables: Vec<Table>,
}

impl TableGroup {
    /// Finds the member table matching `name` case-insensitively.
    pub fn table_named(&self, name: &str) -> Option<&Table> {
        let want = Ident::new(name);
        self.tables.iter().find(|t| *t.name() == want)
    }
}

/// Consumes batches of mutations. This is the inbound face of every
/// sequencer as well as the delegate seam toward the target database.
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept_table_batch(&self, batch: &TableBatch) -> anyhow::Result<()>;
}

/// Executes a batch of row upserts and deletes against the target database
/// within a single transaction. The core never constructs target SQL.
#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply(&self, batch: &TableBatch) -> anyhow::Result<()>;
}

/// Adapts an [`Applier`] into an [`Acceptor`].
pub struct TargetAcceptor {
    applier: Arc<dyn Applier>,
}

impl TargetAcceptor {
    pub fn new(applier: Arc<dyn Applier>) -> Arc<Self> {
        Arc::new(Self { applier })
    }
}

#[async_trait]
impl Acceptor for TargetAcceptor {
    async fn accept_table_batch(&self, batch: &TableBatch) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.applier.apply(batch).await
    }
}

/// Returned by singleton lease holders to signal an orderly, caller-driven
/// release. Never surfaced to operators as a failure.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("singleton lease released by holder")]
pub struct CancelSingleton;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_is_absence_of_data() {
        let m = Mutation {
            key: Bytes::from_static(b"[1]"),
            time: Time::new(1, 0),
            ..Mutation::default()
        };
        assert!(m.is_delete());
        let m = Mutation {
            data: Some(Bytes::from_static(b"{}")),
            ..m
        };
        assert!(!m.is_delete());
    }

    #[test]
    fn group_lookup_is_case_insensitive() {
        let schema = Schema::new("public");
        let group = TableGroup {
            enclosing: schema.clone(),
            name: Ident::new("g"),
            tables: vec![schema.table("t_1"), schema.table("t_2")],
        };
        assert!(group.table_named("T_1").is_some());
        assert!(group.table_named("t_3").is_none());
    }
}
