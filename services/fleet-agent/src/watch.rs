//! Long-poll watch loops over coordination-store keys.
//!
//! One loop per watched key. Each iteration blocks on the store's
//! index-based long-poll; when the index moves, the resync handler runs
//! to completion before the next poll, so resyncs for one key never
//! overlap. Handler failures are logged and the loop keeps going; only
//! the shutdown signal ends it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::store::KvClient;

/// Pause between polls, bounding retry storms when the store errors.
const POLL_PAUSE: Duration = Duration::from_millis(100);

/// Decide whether a poll result fires the handler.
///
/// Only a valid (`> 0`) index different from the last seen one counts;
/// "no index" (transport error or missing header) is "no change".
pub fn next_fire(last_index: u64, new_index: Option<u64>) -> Option<u64> {
    match new_index {
        Some(index) if index > 0 && index != last_index => Some(index),
        _ => None,
    }
}

/// Watch one key until shutdown, invoking `handler` on every index
/// transition.
pub async fn run_watch_loop<F, Fut>(
    kv: Arc<KvClient>,
    key: String,
    wait_secs: u64,
    mut shutdown: watch::Receiver<bool>,
    handler: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut last_index: u64 = 0;
    info!(key = %key, "watch loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let polled = tokio::select! {
            polled = kv.block_query(&key, last_index, wait_secs) => polled,
            _ = shutdown.changed() => continue,
        };

        let new_index = match polled {
            Ok(index) => index,
            Err(e) => {
                debug!(key = %key, error = %e, "watch poll failed");
                None
            }
        };

        if let Some(index) = next_fire(last_index, new_index) {
            last_index = index;
            info!(key = %key, index, "watch fired");
            if let Err(e) = handler().await {
                error!(key = %key, error = %e, "resync handler failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_PAUSE) => {}
            _ = shutdown.changed() => {}
        }
    }

    info!(key = %key, "watch loop stopped");
}
