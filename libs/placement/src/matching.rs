//! Host/label matching and staleness filtering.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

/// What the scheduler needs to know about a live host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub hostname: String,
    /// Key/value tags reported by the host.
    pub labels: BTreeMap<String, String>,
    /// Unix timestamp of the host's last status report.
    pub last_report_ts: i64,
}

/// A host satisfies a condition iff every condition pair appears in its
/// label set. An empty condition matches every host.
pub fn matches_labels(labels: &BTreeMap<String, String>, condition: &BTreeMap<String, String>) -> bool {
    condition
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|lv| lv == v))
}

/// Drop hosts whose last report is older than three report intervals.
///
/// Clocks across the fleet are not synchronized; the 3x window absorbs
/// host-to-host skew.
pub fn fresh_hosts(hosts: Vec<HostInfo>, now_ts: i64, report_interval_secs: i64) -> Vec<HostInfo> {
    hosts
        .into_iter()
        .filter(|h| now_ts - h.last_report_ts <= report_interval_secs * 3)
        .collect()
}

/// Compute each task's matched-host set from its placement condition.
///
/// The input host list must already be staleness-filtered; a matched set
/// never includes a stale host.
pub fn match_hosts<'a>(
    conditions: impl Iterator<Item = (&'a str, &'a BTreeMap<String, String>)>,
    hosts: &[HostInfo],
) -> BTreeMap<String, BTreeSet<String>> {
    let mut matched = BTreeMap::new();
    for (task, condition) in conditions {
        let set: BTreeSet<String> = hosts
            .iter()
            .filter(|h| matches_labels(&h.labels, condition))
            .map(|h| h.hostname.clone())
            .collect();
        debug!(task, hosts = set.len(), "matched hosts");
        matched.insert(task.to_string(), set);
    }
    matched
}
