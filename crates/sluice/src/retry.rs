//! Retry wrapper for transient staging-database failures.

use std::future::Future;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sluice_base::stopper::Stopper;

use crate::staging::store::StagingError;

const BASE_DELAY: Duration = Duration::from_millis(10);
const MAX_DELAY: Duration = Duration::from_secs(1);

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// stopper begins shutdown. Serialization failures, deadlocks, and
/// connection-class errors are absorbed with jittered exponential backoff.
pub async fn retry<T, F, Fut>(stop: &Stopper, mut op: F) -> Result<T, StagingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StagingError>>,
{
    let stopping = stop.stopping();
    let mut rng = SmallRng::from_entropy();
    let mut delay = BASE_DELAY;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                tracing::debug!(code = ?err.code(), "retrying transient staging error");
                let jitter = Duration::from_millis(rng.gen_range(0..=delay.as_millis() as u64));
                tokio::select! {
                    _ = tokio::time::sleep(delay + jitter) => {}
                    _ = stopping.cancelled() => return Err(StagingError::Cancelled),
                }
                delay = (delay * 2).min(MAX_DELAY);
            }
            Err(err) => return Err(err),
        }
    }
}
