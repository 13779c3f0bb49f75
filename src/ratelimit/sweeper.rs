//! Background removal of expired windows.
//!
//! Expired windows are already ignored by `check` and `increment`; sweeping
//! only returns their memory before capacity pressure would.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::registry::LimiterRegistry;

/// Purge every limiter in `registry` once per `every` until the returned
/// handle is aborted.
pub fn spawn_sweeper(registry: Arc<LimiterRegistry>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let purged = registry.purge_expired();
            if purged > 0 {
                debug!(purged = purged, "Swept expired windows");
            }
        }
    })
}
