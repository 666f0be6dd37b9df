//! Background jobs: telemetry retention and local cache sweeping.
//!
//! Telemetry past the retention horizon is deleted daily. Expired entries
//! and rate-limit counters of the in-process cache tier are swept every
//! minute so abusive traffic cannot grow them until the next purge.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::cache::TieredCache;
use crate::AppState;

const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the daily purge and the cache sweeper. Call this once at startup.
pub fn spawn(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    spawn_cache_sweeper(state.cache.clone());

    tokio::spawn(async move {
        let mut interval = time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = run_once(&state).await {
                tracing::error!("cleanup job failed: {}", e);
            }
        }
    })
}

pub fn spawn_cache_sweeper(cache: TieredCache) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweep(&cache);
        }
    })
}

fn sweep(cache: &TieredCache) -> usize {
    let evicted = cache.evict_expired();
    if evicted > 0 {
        tracing::debug!(entries = evicted, "evicted expired cache entries");
    }
    evicted
}

/// One cleanup pass. The cache is swept even when the purge fails.
/// Returns the number of telemetry rows removed.
pub async fn run_once(state: &AppState) -> anyhow::Result<u64> {
    let purged = state.telemetry.purge_expired().await;
    sweep(&state.cache);
    purged.map_err(anyhow::Error::from)
}
