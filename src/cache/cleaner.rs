//! Background cache cleaner
//!
//! Runs a cleaning pass as soon as the cache comes up and then once per
//! poll interval until cancelled.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::registry::Cache;

/// Start the cleaner for `cache`
///
/// Returns `None` without spawning anything if `poll_interval` is zero.
pub(crate) fn spawn(
    cache: &Arc<Cache>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if poll_interval.is_zero() {
        debug!("Cache cleaning thread disabled because poll interval is zero");
        return None;
    }
    Some(tokio::spawn(run(Arc::downgrade(cache), poll_interval, cancel)))
}

async fn run(cache: Weak<Cache>, poll_interval: Duration, cancel: CancellationToken) {
    // The first tick completes immediately
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Cache cleaner exiting");
                return;
            }
            _ = ticker.tick() => {}
        }

        let Some(cache) = cache.upgrade() else {
            debug!("Cache dropped, cleaner exiting");
            return;
        };

        // Passes do blocking disk I/O under the registry lock. Awaiting the
        // task means cancellation never cuts a pass short.
        if let Err(e) = tokio::task::spawn_blocking(move || cache.clean()).await {
            warn!(error = %e, "Cache cleaning pass failed");
        }
    }
}
