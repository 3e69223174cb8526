//! Periodic eviction of finished job groups.
//!
//! Groups that completed longer ago than the scheduler's retention window
//! are dropped together with their event channels.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use renderfarm_pipeline::JobGroupManager;
use tokio_util::sync::CancellationToken;

/// Run the retention sweep loop until `cancel` is triggered.
pub async fn run(manager: Arc<JobGroupManager>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(
        interval_secs = interval.as_secs(),
        retention_secs = manager.config().retention.as_secs(),
        "Group retention job started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Group retention job stopping");
                break;
            }
            _ = ticker.tick() => {
                let evicted = manager.evict_expired(Utc::now()).await;
                if evicted > 0 {
                    tracing::info!(evicted, "Group retention: evicted expired groups");
                } else {
                    tracing::debug!("Group retention: nothing to evict");
                }
            }
        }
    }
}
