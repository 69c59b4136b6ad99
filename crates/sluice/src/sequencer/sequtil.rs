//! Sequencer utilities: singleton execution of a group's pipeline.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use sluice_base::stopper::Stopper;

use crate::leases::Leases;
use crate::types::{CancelSingleton, TableGroup};

/// The work run while a group's lease is held.
pub type GroupWork =
    Arc<dyn Fn(Stopper, TableGroup) -> BoxFuture<'static, ()> + Send + Sync>;

/// Ensures at most one process services a table group. Spawns a task in
/// `ctx` that acquires the `sequtil.Lease.<group>` singleton, runs `work`
/// under a nested stopper bound to the lease lifetime, and drains that
/// stopper before releasing so cancellation errors do not spray the logs.
pub fn lease_group(
    ctx: &Stopper,
    leases: Arc<dyn Leases>,
    group: TableGroup,
    work: GroupWork,
) {
    let outer = ctx.clone();
    ctx.spawn(async move {
        let name = format!("sequtil.Lease.{}", group.name);
        let outer_stopping = outer.stopping();
        let shutdown = outer.stopping();
        let singleton = leases
            .singleton(
                &name,
                Arc::new(move |lease_token| {
                    let group = group.clone();
                    let work = Arc::clone(&work);
                    let outer_stopping = outer_stopping.clone();
                    Box::pin(async move {
                        tracing::trace!(group = %group.name, "group lease acquired");

                        // A nested stopper whose lifetime is bound to the
                        // lease.
                        let sub = Stopper::with_token(lease_token.child_token());
                        {
                            let sub_task = sub.clone();
                            let group = group.clone();
                            let work = Arc::clone(&work);
                            sub.spawn(async move {
                                work(sub_task.clone(), group).await;
                                // Tear down once the main callback exits.
                                sub_task.stop(Duration::from_secs(1));
                                Ok(())
                            });
                        }

                        let sub_stopping = sub.stopping();
                        let result = tokio::select! {
                            _ = lease_token.cancelled() => {
                                // The lease was lost externally; surface
                                // whatever the group's tasks reported.
                                sub.done().await;
                                match sub.err() {
                                    Some(err) => Err(anyhow::anyhow!("{err:#}")),
                                    None => Ok(()),
                                }
                            }
                            _ = outer_stopping.cancelled() => {
                                sub.stop(Duration::from_secs(1));
                                sub.done().await;
                                Err(CancelSingleton.into())
                            }
                            _ = sub_stopping.cancelled() => {
                                // Defer release until all work has stopped.
                                sub.done().await;
                                Err(CancelSingleton.into())
                            }
                        };
                        tracing::trace!(group = %group.name, "group lease released");
                        result
                    })
                }),
            );
        tokio::select! {
            result = singleton => result,
            // A contender still waiting for the lease exits with the
            // scope; nothing is held yet.
            _ = shutdown.cancelled() => Ok(()),
        }
    });
}
