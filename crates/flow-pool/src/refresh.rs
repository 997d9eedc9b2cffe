//! Proactive background refresh
//!
//! Spawns a periodic task that refreshes credentials whose ST expires within
//! a threshold and retries expired ones, so most acquisitions find a Valid
//! credential without waiting. It goes through the same single-flight path
//! as `acquire`, so it never races a request-time refresh.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::pool::Pool;

/// Spawn a background task that proactively refreshes expiring credentials.
///
/// Runs every `interval` and refreshes anything expiring within `threshold`.
/// Failures are left on the credential's state; the next cycle retries.
pub fn spawn_refresh_task(
    pool: Arc<Pool>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, the pool was just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&pool, threshold).await;
        }
    })
}

async fn refresh_cycle(pool: &Pool, threshold: Duration) {
    debug!(threshold_secs = threshold.as_secs(), "background refresh cycle");
    let refreshed = pool.refresh_expiring(threshold).await;
    if refreshed > 0 {
        info!(refreshed, "background refresh cycle complete");
    }
}
