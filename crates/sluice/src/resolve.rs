//! Resolved-timestamp checkpoints and bounds advancement.
//!
//! A [`Resolver`] owns the bounds variable for one target schema. Marking
//! a resolved timestamp persists a monotonic checkpoint row and widens the
//! bounds so sequencers may release staged data. A periodic follow loop
//! picks up checkpoints written by other processes, and the factory's
//! bootstrap scan keeps zero-ingress schemas draining after a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sluice_base::hlc::{Range, Time};
use sluice_base::ident::Schema;
use sluice_base::notify::Var;
use sluice_base::stopper::Stopper;

use crate::staging::store::{StagingError, StagingStore};

const FOLLOW_PERIOD: Duration = Duration::from_secs(1);
const BOOTSTRAP_PERIOD: Duration = Duration::from_secs(60);

/// Per-schema resolved-timestamp state.
pub struct Resolver {
    schema: Schema,
    store: Arc<dyn StagingStore>,
    bounds: Arc<Var<Range>>,
    committed: Var<Time>,
}

impl Resolver {
    /// The bounds variable consumed by this schema's sequencers.
    pub fn bounds(&self) -> Arc<Var<Range>> {
        Arc::clone(&self.bounds)
    }

    /// The last durably recorded resolved timestamp.
    pub fn committed(&self) -> Time {
        self.committed.peek()
    }

    /// Records that everything at or below `time` has been resolved
    /// upstream. Regressions are ignored.
    pub async fn mark(&self, time: Time) -> Result<(), StagingError> {
        if time <= self.committed.peek() {
            return Ok(());
        }
        self.store.write_checkpoint(&self.schema, time).await?;
        self.advance(time);
        Ok(())
    }

    fn advance(&self, time: Time) {
        // Multiple writers race here; keep both vars monotonic.
        self.committed.update(|current| {
            if *current < time {
                *current = time;
            }
        });
        self.bounds.update(|range| {
            *range = range.extended_to(time);
        });
        tracing::trace!(schema = %self.schema, %time, "resolved timestamp advanced");
    }
}

/// Hands out the [`Resolver`] for each target schema.
pub struct Resolvers {
    store: Arc<dyn StagingStore>,
    stop: Stopper,
    instances: tokio::sync::RwLock<HashMap<String, Arc<Resolver>>>,
}

impl Resolvers {
    /// Creates the factory and starts the bootstrap scan, which ensures a
    /// resolver loop exists for every schema already present in the
    /// checkpoint table.
    pub fn new(stop: &Stopper, store: Arc<dyn StagingStore>) -> Arc<Self> {
        let factory = Arc::new(Self {
            store,
            stop: stop.clone(),
            instances: tokio::sync::RwLock::new(HashMap::new()),
        });

        let bootstrap = Arc::clone(&factory);
        let stopping = stop.stopping();
        stop.spawn(async move {
            let mut ticker = tokio::time::interval(BOOTSTRAP_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                match bootstrap.store.scan_checkpoint_schemas().await {
                    Ok(schemas) => {
                        for schema in schemas {
                            if let Err(err) = bootstrap.get(&schema).await {
                                tracing::warn!(%schema, %err, "could not bootstrap schema");
                            }
                        }
                    }
                    Err(err) if err.is_schema_missing() => {}
                    Err(err) => {
                        tracing::warn!(%err, "could not scan for bootstrap schemas");
                    }
                }
                tokio::select! {
                    _ = stopping.cancelled() => return Ok(()),
                    _ = ticker.tick() => {}
                }
            }
        });

        factory
    }

    /// The resolver for `schema`, created on first use.
    pub async fn get(&self, schema: &Schema) -> Result<Arc<Resolver>, StagingError> {
        let key = schema.canonical();
        if let Some(found) = self.instances.read().await.get(&key) {
            return Ok(Arc::clone(found));
        }

        let mut instances = self.instances.write().await;
        if let Some(found) = instances.get(&key) {
            return Ok(Arc::clone(found));
        }

        self.store.ensure_checkpoints().await?;
        let committed = self
            .store
            .read_checkpoint(schema)
            .await?
            .unwrap_or(Time::ZERO);
        let bounds = if committed.is_zero() {
            Range::empty()
        } else {
            Range::including(Time::ZERO, committed)
        };
        let resolver = Arc::new(Resolver {
            schema: schema.clone(),
            store: Arc::clone(&self.store),
            bounds: Arc::new(Var::of(bounds)),
            committed: Var::of(committed),
        });
        self.start_follow_loop(&resolver);
        instances.insert(key, Arc::clone(&resolver));
        Ok(resolver)
    }

    /// Follows checkpoints written by other processes so every node's
    /// bounds advance, not just the one holding the resolver lease.
    fn start_follow_loop(&self, resolver: &Arc<Resolver>) {
        let resolver = Arc::clone(resolver);
        let stopping = self.stop.stopping();
        self.stop.spawn(async move {
            let mut ticker = tokio::time::interval(FOLLOW_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopping.cancelled() => return Ok(()),
                    _ = ticker.tick() => {}
                }
                match resolver.store.read_checkpoint(&resolver.schema).await {
                    Ok(Some(committed)) if committed > resolver.committed.peek() => {
                        resolver.advance(committed);
                    }
                    Ok(_) => {}
                    Err(err) if err.is_schema_missing() => {}
                    Err(err) => {
                        tracing::warn!(schema = %resolver.schema, %err,
                            "could not follow resolved timestamp");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::memory::MemoryStagingStore;

    #[tokio::test]
    async fn mark_advances_bounds_monotonically() {
        let stop = Stopper::new();
        let store = MemoryStagingStore::new();
        let resolvers = Resolvers::new(&stop, store.clone());
        let schema = Schema::new("public");

        let resolver = resolvers.get(&schema).await.expect("resolver");
        resolver.mark(Time::new(10, 0)).await.expect("mark");
        assert_eq!(resolver.committed(), Time::new(10, 0));
        let (bounds, _) = resolver.bounds().get();
        assert_eq!(bounds.max_inclusive(), Time::new(10, 0));

        // Regressions are ignored.
        resolver.mark(Time::new(5, 0)).await.expect("mark");
        assert_eq!(resolver.committed(), Time::new(10, 0));

        stop.stop(Duration::ZERO);
    }

    #[tokio::test]
    async fn checkpoints_survive_restart() {
        let store = MemoryStagingStore::new();
        let schema = Schema::new("public");

        {
            let stop = Stopper::new();
            let resolvers = Resolvers::new(&stop, store.clone());
            let resolver = resolvers.get(&schema).await.expect("resolver");
            resolver.mark(Time::new(7, 0)).await.expect("mark");
            stop.stop(Duration::ZERO);
        }

        let stop = Stopper::new();
        let resolvers = Resolvers::new(&stop, store.clone());
        let resolver = resolvers.get(&schema).await.expect("resolver");
        assert_eq!(resolver.committed(), Time::new(7, 0));
        let (bounds, _) = resolver.bounds().get();
        assert_eq!(bounds.max_inclusive(), Time::new(7, 0));
        stop.stop(Duration::ZERO);
    }

    #[tokio::test]
    async fn bootstrap_scan_finds_known_schemas() {
        let store = MemoryStagingStore::new();
        store
            .write_checkpoint(&Schema::new("zero_traffic"), Time::new(3, 0))
            .await
            .expect("checkpoint");

        let stop = Stopper::new();
        let resolvers = Resolvers::new(&stop, store.clone());
        // The bootstrap loop ticks immediately on startup.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if resolvers
                .instances
                .read()
                .await
                .contains_key("zero_traffic")
            {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "bootstrap never found the schema"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop.stop(Duration::ZERO);
    }
}
