//! Minimal write/delete set between two topologies.

use std::collections::BTreeSet;

use tracing::debug;

use crate::scheduler::Topology;

/// Store operations needed to move the published topology from `old` to
/// `new`. Hosts whose assignment set is unchanged appear in neither list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyDelta {
    /// Hosts whose record must be (re)written, with the full new set.
    pub writes: Vec<(String, BTreeSet<String>)>,
    /// Hosts whose record must be deleted.
    pub deletes: Vec<String>,
}

impl TopologyDelta {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

/// Diff by set membership, not order. An empty assignment set is always
/// expressed as a delete; empty arrays are never written to the store.
pub fn diff_topology(old: &Topology, new: &Topology) -> TopologyDelta {
    let mut delta = TopologyDelta::default();

    for (host, apps) in new {
        if apps.is_empty() {
            continue;
        }
        match old.get(host) {
            Some(old_apps) if old_apps == apps => {
                debug!(host = %host, "topology unchanged");
            }
            _ => delta.writes.push((host.clone(), apps.clone())),
        }
    }

    for host in old.keys() {
        let gone = match new.get(host) {
            None => true,
            Some(apps) => apps.is_empty(),
        };
        if gone {
            delta.deletes.push(host.clone());
        }
    }

    delta
}
