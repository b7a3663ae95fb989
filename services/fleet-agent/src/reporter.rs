//! Periodic node status reporting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::resources::ResourceSnapshot;
use crate::store::records::NodeReport;
use crate::store::KvClient;

/// Publish this host's resource/label report on a fixed interval until
/// shutdown. Other nodes' schedulers use the report (and its timestamp)
/// for matching and staleness.
pub async fn run_report_loop(
    kv: Arc<KvClient>,
    node_name: String,
    labels: BTreeMap<String, String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        node = %node_name,
        interval_secs = interval.as_secs(),
        "status report loop started"
    );
    let mut timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let report = NodeReport {
                    resource: ResourceSnapshot::measure(),
                    label: labels.clone(),
                };
                match kv.report_status(&node_name, &report).await {
                    Ok(true) => debug!(node = %node_name, "status reported"),
                    Ok(false) => warn!(node = %node_name, "status report not acknowledged"),
                    Err(e) => warn!(node = %node_name, error = %e, "status report failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("status report loop shutting down");
                    break;
                }
            }
        }
    }
}

/// Keep the session lease alive on a fixed interval until shutdown.
pub async fn run_session_upkeep(
    sessions: Arc<crate::store::SessionManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "session upkeep started");
    let mut timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let session_id = sessions.ensure().await;
                if session_id.is_empty() {
                    warn!("no session this cycle");
                } else {
                    debug!(session = %session_id, "session alive");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("session upkeep shutting down");
                    break;
                }
            }
        }
    }
}
