//! The staging-database seam.
//!
//! The core talks to the staging database exclusively through
//! [`StagingStore`], so no driver types leak into the staging or sequencing
//! logic. Errors carry an optional SQLSTATE code; classification helpers on
//! [`StagingError`] are the only error introspection the core performs.

use std::io::{Read, Write};

use async_trait::async_trait;
use sluice_base::hlc::{Range, Time};
use sluice_base::ident::{Schema, Table};
use thiserror::Error;

use crate::types::Mutation;

/// Mutation value stored when a row is marked applied without ever having
/// been staged (the direct-apply path).
pub const STUB_SENTINEL: &[u8] = br#"{"__stub__":true}"#;

/// SQLSTATE codes the core reacts to.
pub mod code {
    /// Serialization failure; retryable.
    pub const SERIALIZATION_FAILURE: &str = "40001";
    /// Deadlock detected; retryable.
    pub const DEADLOCK_DETECTED: &str = "40P01";
    /// The staging database does not exist (yet).
    pub const INVALID_CATALOG: &str = "3D000";
    /// The staging table does not exist (yet).
    pub const UNDEFINED_TABLE: &str = "42P01";
    /// A helper function is unavailable on this staging database version.
    pub const UNDEFINED_FUNCTION: &str = "42883";
}

/// Errors produced by a staging store implementation.
#[derive(Debug, Error)]
pub enum StagingError {
    /// A database-level failure, carrying the SQLSTATE when the backend
    /// provides one.
    #[error("staging database error ({}): {message}", .code.as_deref().unwrap_or("unknown"))]
    Db {
        code: Option<String>,
        message: String,
    },
    #[error("staging payload codec: {0}")]
    Codec(#[from] std::io::Error),
    #[error("staging transaction already closed")]
    TxClosed,
    #[error("shutdown in progress")]
    Cancelled,
}

impl StagingError {
    pub fn db(code: impl Into<Option<String>>, message: impl Into<String>) -> Self {
        Self::Db {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Db { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Transient failures absorbed by the retry wrapper.
    pub fn is_retryable(&self) -> bool {
        match self.code() {
            Some(code::SERIALIZATION_FAILURE) | Some(code::DEADLOCK_DETECTED) => true,
            // Connection-class failures.
            Some(c) => c.starts_with("08"),
            None => false,
        }
    }

    /// The staging database or table has not been created yet. Background
    /// loops treat this as "not ready" rather than a failure.
    pub fn is_schema_missing(&self) -> bool {
        matches!(self.code(), Some(code::INVALID_CATALOG) | Some(code::UNDEFINED_TABLE))
    }

    pub fn is_unknown_function(&self) -> bool {
        self.code() == Some(code::UNDEFINED_FUNCTION)
    }
}

/// Mutations transposed into parallel arrays for array-valued parameter
/// binding.
#[derive(Clone, Debug, Default)]
pub struct PackedBatch {
    pub nanos: Vec<i64>,
    pub logical: Vec<i32>,
    pub keys: Vec<String>,
    pub muts: Vec<Vec<u8>>,
    pub befores: Vec<Option<Vec<u8>>>,
    pub deletions: Vec<bool>,
}

impl PackedBatch {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            nanos: Vec::with_capacity(n),
            logical: Vec::with_capacity(n),
            keys: Vec::with_capacity(n),
            muts: Vec::with_capacity(n),
            befores: Vec::with_capacity(n),
            deletions: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.nanos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nanos.is_empty()
    }
}

/// Keys and timestamps only, for filter-applied and mark-applied.
#[derive(Clone, Debug, Default)]
pub struct KeyBatch {
    pub keys: Vec<String>,
    pub nanos: Vec<i64>,
    pub logical: Vec<i32>,
}

impl KeyBatch {
    pub fn from_mutations(muts: &[Mutation]) -> Self {
        let mut out = Self {
            keys: Vec::with_capacity(muts.len()),
            nanos: Vec::with_capacity(muts.len()),
            logical: Vec::with_capacity(muts.len()),
        };
        for m in muts {
            out.keys.push(String::from_utf8_lossy(&m.key).into_owned());
            out.nanos.push(m.time.nanos());
            out.logical.push(m.time.logical());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn slice(&self, begin: usize, end: usize) -> KeyBatch {
        KeyBatch {
            keys: self.keys[begin..end].to_vec(),
            nanos: self.nanos[begin..end].to_vec(),
            logical: self.logical[begin..end].to_vec(),
        }
    }
}

/// Durable store of staged mutations plus the resolved-timestamp checkpoint
/// table. One implementation wraps the SQL staging database; another is a
/// fully in-memory store for embedded use and tests.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Creates the staging table if missing and applies idempotent schema
    /// upgrades.
    async fn ensure_table(&self, table: &Table) -> Result<(), StagingError>;

    /// Upsert-ignore of the packed mutations. Returns the number of rows
    /// actually inserted; the difference from the batch length is the
    /// duplicate count.
    async fn stage(&self, table: &Table, batch: &PackedBatch) -> Result<u64, StagingError>;

    /// Stages only mutations whose key already has an unapplied row.
    /// Returns the input indices that were staged.
    async fn stage_if_exists(
        &self,
        table: &Table,
        batch: &PackedBatch,
    ) -> Result<Vec<usize>, StagingError>;

    /// Returns the input indices whose `(time, key)` rows are marked
    /// applied.
    async fn filter_applied(&self, table: &Table, keys: &KeyBatch)
        -> Result<Vec<usize>, StagingError>;

    /// Marks rows applied, creating stub rows for mutations that were never
    /// staged. Returns the number of rows touched.
    async fn mark_applied(&self, table: &Table, keys: &KeyBatch) -> Result<u64, StagingError>;

    /// Unapplied mutations within `range`, in `(nanos, logical, key)` order,
    /// capped at `limit`.
    async fn read_unapplied(
        &self,
        table: &Table,
        range: Range,
        limit: usize,
    ) -> Result<Vec<Mutation>, StagingError>;

    /// Deletes up to `limit` applied rows in `[from, end)`, lowest
    /// timestamps first. Returns the timestamp of the last row deleted, or
    /// None when nothing qualified.
    async fn retire_batch(
        &self,
        table: &Table,
        from: Time,
        end: Time,
        limit: i64,
    ) -> Result<Option<Time>, StagingError>;

    /// Count of unapplied rows strictly below `before`. `follower_read`
    /// permits a slightly stale read against the staging database.
    async fn count_unapplied(
        &self,
        table: &Table,
        before: Time,
        follower_read: bool,
    ) -> Result<i64, StagingError>;

    /// Counts keys whose applied rows are not a time-prefix, i.e. an
    /// unapplied mutation exists below an applied one for the same key.
    async fn check_consistency(
        &self,
        table: &Table,
        keys: Option<&[String]>,
        follower_read: bool,
    ) -> Result<i64, StagingError>;

    /// Creates the checkpoint table if missing.
    async fn ensure_checkpoints(&self) -> Result<(), StagingError>;

    /// Persists the resolved timestamp for a schema. Never regresses.
    async fn write_checkpoint(&self, schema: &Schema, time: Time) -> Result<(), StagingError>;

    async fn read_checkpoint(&self, schema: &Schema) -> Result<Option<Time>, StagingError>;

    /// All schemas with a checkpoint row, for bootstrap.
    async fn scan_checkpoint_schemas(&self) -> Result<Vec<Schema>, StagingError>;

    /// Opens a staging transaction. Write operations made through the
    /// returned handle become visible atomically at commit.
    async fn begin(&self) -> Result<Box<dyn StagingTxn>, StagingError>;

    /// True when this handle is itself a transaction; callers then run
    /// batches sequentially instead of fanning out.
    fn in_transaction(&self) -> bool {
        false
    }
}

/// A staging transaction. Dropping without commit rolls back; the rollback
/// survives caller cancellation.
#[async_trait]
pub trait StagingTxn: StagingStore {
    async fn commit(self: Box<Self>) -> Result<(), StagingError>;
    async fn rollback(self: Box<Self>) -> Result<(), StagingError>;
}

/// Payloads at or above this size are transparently compressed before
/// staging.
pub const COMPRESS_THRESHOLD: usize = 4 * 1024;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Compresses `raw` when it is large enough to be worth it. Small or
/// incompressible payloads are stored verbatim; JSON never begins with the
/// zstd frame magic, so [`maybe_decompress`] can sniff the result.
pub fn maybe_compress(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    if raw.len() < COMPRESS_THRESHOLD {
        return Ok(raw.to_vec());
    }
    let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(raw)?;
    let compressed = encoder.finish()?;
    if compressed.len() < raw.len() {
        Ok(compressed)
    } else {
        Ok(raw.to_vec())
    }
}

/// Reverses [`maybe_compress`].
pub fn maybe_decompress(stored: &[u8]) -> std::io::Result<Vec<u8>> {
    if !stored.starts_with(&ZSTD_MAGIC) {
        return Ok(stored.to_vec());
    }
    let mut decoder = zstd::stream::read::Decoder::new(stored)?;
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payloads_stay_verbatim() {
        let raw = br#"{"k":1}"#;
        let stored = maybe_compress(raw).unwrap();
        assert_eq!(stored, raw);
        assert_eq!(maybe_decompress(&stored).unwrap(), raw);
    }

    #[test]
    fn large_payloads_round_trip() {
        let raw = format!(r#"{{"v":"{}"}}"#, "x".repeat(2 * COMPRESS_THRESHOLD)).into_bytes();
        let stored = maybe_compress(&raw).unwrap();
        assert!(stored.len() < raw.len(), "repetitive payload should shrink");
        assert_eq!(maybe_decompress(&stored).unwrap(), raw);
    }

    #[test]
    fn error_classification() {
        let retryable = StagingError::db(Some(code::SERIALIZATION_FAILURE.to_string()), "retry");
        assert!(retryable.is_retryable());
        assert!(!retryable.is_schema_missing());

        let missing = StagingError::db(Some(code::UNDEFINED_TABLE.to_string()), "no table");
        assert!(missing.is_schema_missing());
        assert!(!missing.is_retryable());

        let conn = StagingError::db(Some("08006".to_string()), "connection lost");
        assert!(conn.is_retryable());

        let plain = StagingError::db(None, "anything");
        assert!(!plain.is_retryable());
    }
}
