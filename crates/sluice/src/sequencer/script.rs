//! Script-wrapped sequencer: user transformations run on the way in, apply
//! overrides run on the way out.
//!
//! The inbound face resolves the configured source by group name and fans
//! each mutation out to its target tables; the delegate face applies
//! per-table rewrites (`map`, `delete_key`, extras folding) and honors
//! `apply` overrides with a single-use transactional handle.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use sluice_base::ident::Table;
use sluice_base::stopper::Stopper;

use super::{Sequencer, StartOptions, Stats};
use crate::script::{
    document_of, meta_of, rewrite_delete_key, transform_document, ApplyTx, UserScript,
};
use crate::types::{Acceptor, Mutation, TableBatch, TableGroup};

/// Wraps an inner sequencer with user-script behavior.
pub struct Script {
    script: Arc<UserScript>,
    inner: Arc<dyn Sequencer>,
}

impl Script {
    pub fn wrap(script: Arc<UserScript>, inner: Arc<dyn Sequencer>) -> Arc<Self> {
        Arc::new(Self { script, inner })
    }
}

#[async_trait]
impl Sequencer for Script {
    async fn start(
        &self,
        ctx: &Stopper,
        opts: &StartOptions,
    ) -> anyhow::Result<(Arc<dyn Acceptor>, Stats)> {
        let delegate = Arc::new(ApplyInterceptor {
            script: Arc::clone(&self.script),
            delegate: Arc::clone(&opts.delegate),
        });
        let inner_opts = StartOptions {
            bounds: Arc::clone(&opts.bounds),
            delegate,
            group: opts.group.clone(),
        };
        let (acceptor, stats) = self.inner.start(ctx, &inner_opts).await?;
        Ok((
            Arc::new(DispatchAcceptor {
                script: Arc::clone(&self.script),
                group: opts.group.clone(),
                inner: acceptor,
            }),
            stats,
        ))
    }
}

/// Inbound face: source dispatch and fan-out.
struct DispatchAcceptor {
    script: Arc<UserScript>,
    group: TableGroup,
    inner: Arc<dyn Acceptor>,
}

#[async_trait]
impl Acceptor for DispatchAcceptor {
    async fn accept_table_batch(&self, batch: &TableBatch) -> anyhow::Result<()> {
        let Some(source) = self.script.source_for(&self.group.name) else {
            // No matching source: the batch passes through untouched.
            return self.inner.accept_table_batch(batch).await;
        };

        let mut routed: BTreeMap<Table, Vec<Mutation>> = BTreeMap::new();
        for mutation in &batch.mutations {
            let dispatch = if mutation.is_delete() {
                source.deletes_to.as_ref().unwrap_or(&source.dispatch)
            } else {
                &source.dispatch
            };
            let doc = document_of(mutation)?;
            let meta = meta_of(&batch.table, mutation);
            for (name, docs) in dispatch(&doc, &meta)? {
                let target = match self.group.table_named(&name) {
                    Some(table) => table.clone(),
                    None => self.group.enclosing.table(name),
                };
                for doc in docs {
                    let routed_mut = if mutation.is_delete() {
                        Mutation {
                            key: mutation.key.clone(),
                            data: None,
                            before: mutation.before.clone(),
                            time: batch.time,
                            meta: mutation.meta.clone(),
                        }
                    } else {
                        Mutation {
                            key: mutation.key.clone(),
                            data: Some(Bytes::from(serde_json::to_vec(&Value::Object(doc))?)),
                            before: mutation.before.clone(),
                            time: batch.time,
                            meta: mutation.meta.clone(),
                        }
                    };
                    routed.entry(target.clone()).or_default().push(routed_mut);
                }
            }
        }

        if routed.is_empty() {
            // The source consumed the batch without producing targets; an
            // empty batch keeps progress moving.
            return self
                .inner
                .accept_table_batch(&TableBatch::new(batch.table.clone(), batch.time, Vec::new()))
                .await;
        }
        for (table, mutations) in routed {
            self.inner
                .accept_table_batch(&TableBatch::new(table, batch.time, mutations))
                .await?;
        }
        Ok(())
    }
}

/// Delegate face: per-table rewrites and apply overrides.
struct ApplyInterceptor {
    script: Arc<UserScript>,
    delegate: Arc<dyn Acceptor>,
}

#[async_trait]
impl Acceptor for ApplyInterceptor {
    async fn accept_table_batch(&self, batch: &TableBatch) -> anyhow::Result<()> {
        let Some(binding) = self.script.table_for(batch.table.name()) else {
            return self.delegate.accept_table_batch(batch).await;
        };
        if batch.is_empty() {
            return self.delegate.accept_table_batch(batch).await;
        }

        let mut ops = batch.mutations.clone();
        for op in &mut ops {
            if op.is_delete() {
                rewrite_delete_key(binding, op)?;
            } else if binding.map.is_some() || binding.extras.is_some() {
                let doc = document_of(op)?;
                let doc = transform_document(binding, doc)?;
                op.data = Some(Bytes::from(serde_json::to_vec(&Value::Object(doc))?));
            }
        }

        match &binding.apply {
            Some(over) => {
                let tx = ApplyTx::new(&*self.delegate, &batch.table, batch.time);
                over.apply(&tx, ops).await
            }
            None => {
                self.delegate
                    .accept_table_batch(&TableBatch::new(batch.table.clone(), batch.time, ops))
                    .await
            }
        }
    }
}
