//! SQL-backed staging store for CockroachDB-compatible databases.
//!
//! Batch operations bind parallel arrays and `unnest` them server-side so a
//! whole batch travels in one statement. Hot columns (`applied`,
//! `applied_at`) live in their own column family so marking rows applied
//! does not rewrite payload bytes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sluice_base::hlc::{Range, Time};
use sluice_base::ident::{Schema, Table};
use tokio::sync::OwnedMutexGuard;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use super::store::{KeyBatch, PackedBatch, StagingError, StagingStore, StagingTxn};
use crate::types::Mutation;

const TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS {table} (
       nanos INT8 NOT NULL,
     logical INT4 NOT NULL,
         key STRING NOT NULL,
         mut BYTES NOT NULL,
      before BYTES NULL,
     applied BOOL NOT NULL DEFAULT false,
  applied_at TIMESTAMPTZ NULL,
    deletion BOOL NOT NULL DEFAULT false,
  {source_time}
  PRIMARY KEY (nanos, logical, key),
    INDEX {index} (key) STORING (applied),
   FAMILY cold (mut, before, deletion),
   FAMILY hot (applied, applied_at)
)"#;

// Never queried by the core; aids operators inspecting staged backlogs.
const SOURCE_TIME_COLUMN: &str =
    "source_time TIMESTAMPTZ AS (to_timestamp(nanos::FLOAT8 / 1e9)) VIRTUAL,";

const STAGE: &str = r#"
INSERT INTO {table} (nanos, logical, key, mut, before, deletion)
SELECT unnest($1::INT8[]),
       unnest($2::INT4[]),
       unnest($3::STRING[]),
       unnest($4::BYTES[]),
       unnest($5::BYTES[]),
       unnest($6::BOOL[])
ON CONFLICT DO NOTHING"#;

const STAGE_IF_EXISTS: &str = r#"
WITH
proposed (idx, nanos, logical, key, mut, before, deletion) AS (
  SELECT
    row_number() OVER (),
    unnest($1::INT8[]),
    unnest($2::INT4[]),
    unnest($3::STRING[]),
    unnest($4::BYTES[]),
    unnest($5::BYTES[]),
    unnest($6::BOOL[])),
existing AS (
  SELECT DISTINCT proposed.key
  FROM proposed
  JOIN {table} existing
  ON (proposed.key = existing.key AND NOT existing.applied)),
action AS (
  UPSERT INTO {table} (nanos, logical, key, mut, before, deletion)
  SELECT nanos, logical, key, mut, before, deletion
  FROM proposed
  JOIN existing USING (key)
  RETURNING true)
SELECT idx FROM proposed
JOIN existing USING (key)"#;

const FILTER_APPLIED: &str = r#"
WITH ids (idx, key, nanos, logical) AS (
  SELECT row_number() OVER (), unnest($1::STRING[]), unnest($2::INT8[]), unnest($3::INT4[]))
SELECT idx FROM ids
JOIN {table}
USING (key, nanos, logical)
WHERE applied"#;

const MARK_APPLIED: &str = r#"
WITH t (key, nanos, logical) AS (
  SELECT unnest($1::STRING[]), unnest($2::INT8[]), unnest($3::INT4[]))
INSERT INTO {table} (key, nanos, logical, applied, applied_at, mut)
SELECT t.key, t.nanos, t.logical, true, now(), '{"__stub__":true}' FROM t
ON CONFLICT (nanos, logical, key)
DO UPDATE SET applied = true, applied_at = now()"#;

const READ_UNAPPLIED: &str = r#"
SELECT nanos, logical, key, mut, before, deletion
FROM {table}
WHERE (nanos, logical) >= ($1, $2) AND (nanos, logical) < ($3, $4) AND NOT applied
ORDER BY nanos, logical, key
LIMIT $5"#;

const RETIRE: &str = r#"
WITH d AS (
     DELETE FROM {table}
      WHERE (nanos, logical) >= ($1, $2) AND (nanos, logical) < ($3, $4) AND applied
   ORDER BY nanos, logical
      LIMIT $5
  RETURNING nanos, logical)
SELECT nanos, logical FROM d
ORDER BY nanos DESC, logical DESC
LIMIT 1"#;

const COUNT_UNAPPLIED: &str = r#"
SELECT count(*) FROM {table} {aost}
WHERE (nanos, logical) < ($1, $2) AND NOT applied"#;

const CHECK_CONSISTENCY: &str = r#"
SELECT count(*) FROM {table} AS u {aost}
WHERE NOT u.applied
  AND ($1::STRING[] IS NULL OR u.key = ANY ($1::STRING[]))
  AND EXISTS (
    SELECT 1 FROM {table} AS a
    WHERE a.key = u.key AND a.applied AND (a.nanos, a.logical) > (u.nanos, u.logical))"#;

const CHECKPOINT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS {table} (
      schema STRING PRIMARY KEY,
       nanos INT8 NOT NULL,
     logical INT4 NOT NULL,
  updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)"#;

const WRITE_CHECKPOINT: &str = r#"
INSERT INTO {table} AS ckpt (schema, nanos, logical)
VALUES ($1, $2, $3)
ON CONFLICT (schema)
DO UPDATE SET nanos = excluded.nanos, logical = excluded.logical, updated_at = now()
WHERE (excluded.nanos, excluded.logical) > (ckpt.nanos, ckpt.logical)"#;

const AOST: &str = "AS OF SYSTEM TIME follower_read_timestamp()";

fn table_sql(table: &Table) -> String {
    format!(
        r#""{}"."{}""#,
        table.schema().canonical(),
        table.name().canonical()
    )
}

fn pg_err(err: tokio_postgres::Error) -> StagingError {
    StagingError::Db {
        code: err.code().map(|state| state.code().to_string()),
        message: err.to_string(),
    }
}

/// Staging store backed by a single `tokio_postgres` connection. The
/// connection is mutex-guarded so a transaction can claim it exclusively.
pub struct PgStagingStore {
    client: Arc<tokio::sync::Mutex<Client>>,
    checkpoints: Table,
}

impl PgStagingStore {
    /// Wraps an established client. The checkpoint table lives in
    /// `staging_schema`, alongside the staging tables.
    pub fn new(client: Client, staging_schema: &Schema) -> Arc<Self> {
        Arc::new(Self {
            client: Arc::new(tokio::sync::Mutex::new(client)),
            checkpoints: staging_schema.table("checkpoints"),
        })
    }
}

async fn ensure_table_on(client: &Client, table: &Table) -> Result<(), StagingError> {
    let name = table_sql(table);
    let index = format!("{}_key_applied", table.name().canonical());
    let create = TABLE_SCHEMA
        .replace("{table}", &name)
        .replace("{index}", &index);

    // Try with the helper virtual column first; older staging databases do
    // not know about to_timestamp().
    let with_helper = create.replace("{source_time}", SOURCE_TIME_COLUMN);
    if let Err(err) = client.batch_execute(&with_helper).await.map_err(pg_err) {
        if !err.is_unknown_function() {
            return Err(err);
        }
        let without = create.replace("{source_time}", "");
        client.batch_execute(&without).await.map_err(pg_err)?;
    }

    // Transparently upgrade staging tables created by older releases.
    for upgrade in [
        format!("ALTER TABLE {name} ADD COLUMN IF NOT EXISTS before BYTES NULL"),
        format!("ALTER TABLE {name} ADD COLUMN IF NOT EXISTS applied_at TIMESTAMPTZ NULL"),
        format!("ALTER TABLE {name} ADD COLUMN IF NOT EXISTS deletion BOOL NULL"),
        format!("CREATE INDEX IF NOT EXISTS {index} ON {name} (key) STORING (applied)"),
    ] {
        client.batch_execute(&upgrade).await.map_err(pg_err)?;
    }
    tracing::trace!(table = %table, "staging schema ready");
    Ok(())
}

async fn stage_on(
    client: &Client,
    table: &Table,
    batch: &PackedBatch,
) -> Result<u64, StagingError> {
    let sql = STAGE.replace("{table}", &table_sql(table));
    let params: [&(dyn ToSql + Sync); 6] = [
        &batch.nanos,
        &batch.logical,
        &batch.keys,
        &batch.muts,
        &batch.befores,
        &batch.deletions,
    ];
    client.execute(&sql, &params).await.map_err(pg_err)
}

async fn stage_if_exists_on(
    client: &Client,
    table: &Table,
    batch: &PackedBatch,
) -> Result<Vec<usize>, StagingError> {
    let sql = STAGE_IF_EXISTS.replace("{table}", &table_sql(table));
    let params: [&(dyn ToSql + Sync); 6] = [
        &batch.nanos,
        &batch.logical,
        &batch.keys,
        &batch.muts,
        &batch.befores,
        &batch.deletions,
    ];
    let rows = client.query(&sql, &params).await.map_err(pg_err)?;
    rows.into_iter()
        .map(|row| {
            let idx: i64 = row.try_get(0).map_err(pg_err)?;
            // row_number() is 1-based.
            Ok(idx as usize - 1)
        })
        .collect()
}

async fn filter_applied_on(
    client: &Client,
    table: &Table,
    keys: &KeyBatch,
) -> Result<Vec<usize>, StagingError> {
    let sql = FILTER_APPLIED.replace("{table}", &table_sql(table));
    let params: [&(dyn ToSql + Sync); 3] = [&keys.keys, &keys.nanos, &keys.logical];
    let rows = client.query(&sql, &params).await.map_err(pg_err)?;
    rows.into_iter()
        .map(|row| {
            let idx: i64 = row.try_get(0).map_err(pg_err)?;
            Ok(idx as usize - 1)
        })
        .collect()
}

async fn mark_applied_on(
    client: &Client,
    table: &Table,
    keys: &KeyBatch,
) -> Result<u64, StagingError> {
    let sql = MARK_APPLIED.replace("{table}", &table_sql(table));
    let params: [&(dyn ToSql + Sync); 3] = [&keys.keys, &keys.nanos, &keys.logical];
    client.execute(&sql, &params).await.map_err(pg_err)
}

async fn read_unapplied_on(
    client: &Client,
    table: &Table,
    range: Range,
    limit: usize,
) -> Result<Vec<Mutation>, StagingError> {
    let sql = READ_UNAPPLIED.replace("{table}", &table_sql(table));
    let limit = limit as i64;
    let params: [&(dyn ToSql + Sync); 5] = [
        &range.min().nanos(),
        &range.min().logical(),
        &range.max().nanos(),
        &range.max().logical(),
        &limit,
    ];
    let rows = client.query(&sql, &params).await.map_err(pg_err)?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let nanos: i64 = row.try_get(0).map_err(pg_err)?;
        let logical: i32 = row.try_get(1).map_err(pg_err)?;
        let key: String = row.try_get(2).map_err(pg_err)?;
        let payload: Vec<u8> = row.try_get(3).map_err(pg_err)?;
        let before: Option<Vec<u8>> = row.try_get(4).map_err(pg_err)?;
        let deletion: bool = row.try_get(5).map_err(pg_err)?;
        let data = if deletion {
            None
        } else {
            Some(Bytes::from(super::store::maybe_decompress(&payload)?))
        };
        let before = match before {
            Some(b) => Some(Bytes::from(super::store::maybe_decompress(&b)?)),
            None => None,
        };
        out.push(Mutation {
            key: Bytes::from(key.into_bytes()),
            data,
            before,
            time: Time::new(nanos, logical),
            meta: Default::default(),
        });
    }
    Ok(out)
}

async fn retire_batch_on(
    client: &Client,
    table: &Table,
    from: Time,
    end: Time,
    limit: i64,
) -> Result<Option<Time>, StagingError> {
    let sql = RETIRE.replace("{table}", &table_sql(table));
    let params: [&(dyn ToSql + Sync); 5] = [
        &from.nanos(),
        &from.logical(),
        &end.nanos(),
        &end.logical(),
        &limit,
    ];
    let row = client.query_opt(&sql, &params).await.map_err(pg_err)?;
    match row {
        Some(row) => {
            let nanos: i64 = row.try_get(0).map_err(pg_err)?;
            let logical: i32 = row.try_get(1).map_err(pg_err)?;
            Ok(Some(Time::new(nanos, logical)))
        }
        None => Ok(None),
    }
}

async fn count_unapplied_on(
    client: &Client,
    table: &Table,
    before: Time,
    follower_read: bool,
) -> Result<i64, StagingError> {
    let sql = COUNT_UNAPPLIED
        .replace("{table}", &table_sql(table))
        .replace("{aost}", if follower_read { AOST } else { "" });
    let params: [&(dyn ToSql + Sync); 2] = [&before.nanos(), &before.logical()];
    let row = client.query_one(&sql, &params).await.map_err(pg_err)?;
    row.try_get(0).map_err(pg_err)
}

async fn check_consistency_on(
    client: &Client,
    table: &Table,
    keys: Option<&[String]>,
    follower_read: bool,
) -> Result<i64, StagingError> {
    let sql = CHECK_CONSISTENCY
        .replace("{table}", &table_sql(table))
        .replace("{aost}", if follower_read { AOST } else { "" });
    let keys: Option<Vec<String>> = keys.map(|k| k.to_vec());
    let params: [&(dyn ToSql + Sync); 1] = [&keys];
    let row = client.query_one(&sql, &params).await.map_err(pg_err)?;
    row.try_get(0).map_err(pg_err)
}

#[async_trait]
impl StagingStore for PgStagingStore {
    async fn ensure_table(&self, table: &Table) -> Result<(), StagingError> {
        ensure_table_on(&*self.client.lock().await, table).await
    }

    async fn stage(&self, table: &Table, batch: &PackedBatch) -> Result<u64, StagingError> {
        stage_on(&*self.client.lock().await, table, batch).await
    }

    async fn stage_if_exists(
        &self,
        table: &Table,
        batch: &PackedBatch,
    ) -> Result<Vec<usize>, StagingError> {
        stage_if_exists_on(&*self.client.lock().await, table, batch).await
    }

    async fn filter_applied(
        &self,
        table: &Table,
        keys: &KeyBatch,
    ) -> Result<Vec<usize>, StagingError> {
        filter_applied_on(&*self.client.lock().await, table, keys).await
    }

    async fn mark_applied(&self, table: &Table, keys: &KeyBatch) -> Result<u64, StagingError> {
        mark_applied_on(&*self.client.lock().await, table, keys).await
    }

    async fn read_unapplied(
        &self,
        table: &Table,
        range: Range,
        limit: usize,
    ) -> Result<Vec<Mutation>, StagingError> {
        read_unapplied_on(&*self.client.lock().await, table, range, limit).await
    }

    async fn retire_batch(
        &self,
        table: &Table,
        from: Time,
        end: Time,
        limit: i64,
    ) -> Result<Option<Time>, StagingError> {
        retire_batch_on(&*self.client.lock().await, table, from, end, limit).await
    }

    async fn count_unapplied(
        &self,
        table: &Table,
        before: Time,
        follower_read: bool,
    ) -> Result<i64, StagingError> {
        count_unapplied_on(&*self.client.lock().await, table, before, follower_read).await
    }

    async fn check_consistency(
        &self,
        table: &Table,
        keys: Option<&[String]>,
        follower_read: bool,
    ) -> Result<i64, StagingError> {
        check_consistency_on(&*self.client.lock().await, table, keys, follower_read).await
    }

    async fn ensure_checkpoints(&self) -> Result<(), StagingError> {
        let sql = CHECKPOINT_SCHEMA.replace("{table}", &table_sql(&self.checkpoints));
        self.client
            .lock()
            .await
            .batch_execute(&sql)
            .await
            .map_err(pg_err)
    }

    async fn write_checkpoint(&self, schema: &Schema, time: Time) -> Result<(), StagingError> {
        let sql = WRITE_CHECKPOINT.replace("{table}", &table_sql(&self.checkpoints));
        let name = schema.canonical();
        let params: [&(dyn ToSql + Sync); 3] = [&name, &time.nanos(), &time.logical()];
        self.client
            .lock()
            .await
            .execute(&sql, &params)
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn read_checkpoint(&self, schema: &Schema) -> Result<Option<Time>, StagingError> {
        let sql = format!(
            "SELECT nanos, logical FROM {} WHERE schema = $1",
            table_sql(&self.checkpoints)
        );
        let name = schema.canonical();
        let params: [&(dyn ToSql + Sync); 1] = [&name];
        let row = self
            .client
            .lock()
            .await
            .query_opt(&sql, &params)
            .await
            .map_err(pg_err)?;
        match row {
            Some(row) => {
                let nanos: i64 = row.try_get(0).map_err(pg_err)?;
                let logical: i32 = row.try_get(1).map_err(pg_err)?;
                Ok(Some(Time::new(nanos, logical)))
            }
            None => Ok(None),
        }
    }

    async fn scan_checkpoint_schemas(&self) -> Result<Vec<Schema>, StagingError> {
        let sql = format!("SELECT schema FROM {}", table_sql(&self.checkpoints));
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[])
            .await
            .map_err(pg_err)?;
        rows.into_iter()
            .map(|row| {
                let name: String = row.try_get(0).map_err(pg_err)?;
                Ok(Schema::new(name))
            })
            .collect()
    }

    async fn begin(&self) -> Result<Box<dyn StagingTxn>, StagingError> {
        let guard = Arc::clone(&self.client).lock_owned().await;
        guard.batch_execute("BEGIN").await.map_err(pg_err)?;
        Ok(Box::new(PgTxn {
            guard: Some(guard),
            checkpoints: self.checkpoints.clone(),
        }))
    }
}

/// An open staging transaction holding the connection exclusively.
pub struct PgTxn {
    guard: Option<OwnedMutexGuard<Client>>,
    checkpoints: Table,
}

impl PgTxn {
    fn client(&self) -> Result<&Client, StagingError> {
        self.guard.as_deref().ok_or(StagingError::TxClosed)
    }
}

impl Drop for PgTxn {
    fn drop(&mut self) {
        // The rollback must outlive the caller's cancellation, so it runs
        // detached rather than inline.
        if let Some(guard) = self.guard.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(err) = guard.batch_execute("ROLLBACK").await {
                        tracing::warn!(%err, "rollback of abandoned staging transaction failed");
                    }
                });
            }
        }
    }
}

#[async_trait]
impl StagingStore for PgTxn {
    async fn ensure_table(&self, table: &Table) -> Result<(), StagingError> {
        ensure_table_on(self.client()?, table).await
    }

    async fn stage(&self, table: &Table, batch: &PackedBatch) -> Result<u64, StagingError> {
        stage_on(self.client()?, table, batch).await
    }

    async fn stage_if_exists(
        &self,
        table: &Table,
        batch: &PackedBatch,
    ) -> Result<Vec<usize>, StagingError> {
        stage_if_exists_on(self.client()?, table, batch).await
    }

    async fn filter_applied(
        &self,
        table: &Table,
        keys: &KeyBatch,
    ) -> Result<Vec<usize>, StagingError> {
        filter_applied_on(self.client()?, table, keys).await
    }

    async fn mark_applied(&self, table: &Table, keys: &KeyBatch) -> Result<u64, StagingError> {
        mark_applied_on(self.client()?, table, keys).await
    }

    async fn read_unapplied(
        &self,
        table: &Table,
        range: Range,
        limit: usize,
    ) -> Result<Vec<Mutation>, StagingError> {
        read_unapplied_on(self.client()?, table, range, limit).await
    }

    async fn retire_batch(
        &self,
        table: &Table,
        from: Time,
        end: Time,
        limit: i64,
    ) -> Result<Option<Time>, StagingError> {
        retire_batch_on(self.client()?, table, from, end, limit).await
    }

    async fn count_unapplied(
        &self,
        table: &Table,
        before: Time,
        follower_read: bool,
    ) -> Result<i64, StagingError> {
        count_unapplied_on(self.client()?, table, before, follower_read).await
    }

    async fn check_consistency(
        &self,
        table: &Table,
        keys: Option<&[String]>,
        follower_read: bool,
    ) -> Result<i64, StagingError> {
        check_consistency_on(self.client()?, table, keys, follower_read).await
    }

    async fn ensure_checkpoints(&self) -> Result<(), StagingError> {
        let sql = CHECKPOINT_SCHEMA.replace("{table}", &table_sql(&self.checkpoints));
        self.client()?.batch_execute(&sql).await.map_err(pg_err)
    }

    async fn write_checkpoint(&self, schema: &Schema, time: Time) -> Result<(), StagingError> {
        let sql = WRITE_CHECKPOINT.replace("{table}", &table_sql(&self.checkpoints));
        let name = schema.canonical();
        let params: [&(dyn ToSql + Sync); 3] = [&name, &time.nanos(), &time.logical()];
        self.client()?.execute(&sql, &params).await.map_err(pg_err)?;
        Ok(())
    }

    async fn read_checkpoint(&self, _schema: &Schema) -> Result<Option<Time>, StagingError> {
        Err(StagingError::db(
            None,
            "checkpoint reads are not supported inside a staging transaction",
        ))
    }

    async fn scan_checkpoint_schemas(&self) -> Result<Vec<Schema>, StagingError> {
        Err(StagingError::db(
            None,
            "checkpoint scans are not supported inside a staging transaction",
        ))
    }

    async fn begin(&self) -> Result<Box<dyn StagingTxn>, StagingError> {
        Err(StagingError::db(
            None,
            "nested staging transactions are not supported",
        ))
    }

    fn in_transaction(&self) -> bool {
        true
    }
}

#[async_trait]
impl StagingTxn for PgTxn {
    async fn commit(self: Box<Self>) -> Result<(), StagingError> {
        let mut this = self;
        let guard = this.guard.take().ok_or(StagingError::TxClosed)?;
        guard.batch_execute("COMMIT").await.map_err(pg_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StagingError> {
        let mut this = self;
        let guard = this.guard.take().ok_or(StagingError::TxClosed)?;
        guard.batch_execute("ROLLBACK").await.map_err(pg_err)
    }
}
