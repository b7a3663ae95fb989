//! Two-pass replica-preserving task scheduler.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

/// Per-host set of assigned task names. A host absent from the map has
/// zero assignments and its store record must be deleted, not left as-is.
pub type Topology = BTreeMap<String, BTreeSet<String>>;

/// One declared task as the scheduler sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDemand {
    pub name: String,
    /// Desired replica count; tasks with a non-positive count are skipped.
    pub replication: i64,
    /// Per-replica memory, used only for ranking candidate hosts.
    pub memory_mb: u64,
    /// Hosts satisfying the task's placement condition this cycle.
    pub matched_hosts: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct HostLoad {
    apps: u64,
    memory_mb: u64,
}

/// Compute the new topology from the declared tasks and the previously
/// published one.
///
/// Pass 1 keeps every assignment whose host still matches, so a running
/// task is never moved just because a less-loaded host appeared. Pass 2
/// fills the remaining replicas onto the least-loaded matched hosts,
/// ranked by `(assigned apps, assigned memory, hostname)`. The hostname
/// tie-break keeps the output reproducible for identical inputs.
pub fn schedule(tasks: &[TaskDemand], old_topology: &Topology) -> Topology {
    let mut new_topology = Topology::new();
    let mut load: BTreeMap<String, HostLoad> = BTreeMap::new();

    // Remaining replication and unspent candidates per task.
    let mut remaining: BTreeMap<&str, i64> = BTreeMap::new();
    let mut candidates: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for task in tasks {
        if task.replication <= 0 {
            continue;
        }
        remaining.insert(&task.name, task.replication);
        candidates.insert(
            &task.name,
            task.matched_hosts.iter().map(String::as_str).collect(),
        );
    }

    fn assign(
        topology: &mut Topology,
        load: &mut BTreeMap<String, HostLoad>,
        host: &str,
        task: &TaskDemand,
    ) {
        topology
            .entry(host.to_string())
            .or_default()
            .insert(task.name.clone());
        let entry = load.entry(host.to_string()).or_default();
        entry.apps += 1;
        entry.memory_mb += task.memory_mb;
    }

    // Stability pass: retain assignments that still match.
    for task in tasks {
        let Some(spendable) = candidates.get_mut(task.name.as_str()) else {
            continue;
        };
        for (host, apps) in old_topology {
            if spendable.contains(host.as_str()) && apps.contains(&task.name) {
                spendable.remove(host.as_str());
                if let Some(left) = remaining.get_mut(task.name.as_str()) {
                    *left -= 1;
                }
                assign(&mut new_topology, &mut load, host, task);
                debug!(task = %task.name, host = %host, "assignment retained");
            }
        }
    }

    // Fill pass: least-loaded hosts take the remaining replicas.
    for task in tasks {
        let Some(&left) = remaining.get(task.name.as_str()) else {
            continue;
        };
        if left <= 0 {
            continue;
        }
        let spendable = &candidates[task.name.as_str()];
        let mut ranked: Vec<&str> = spendable.iter().copied().collect();
        ranked.sort_by_key(|h| {
            let l = load.get(*h).copied().unwrap_or_default();
            (l.apps, l.memory_mb, *h)
        });

        if (left as usize) > ranked.len() {
            warn!(
                task = %task.name,
                replication = left,
                candidates = ranked.len(),
                "not enough matched hosts for task"
            );
        }
        for host in ranked.into_iter().take(left as usize) {
            assign(&mut new_topology, &mut load, host, task);
            debug!(task = %task.name, host, "assignment added");
        }
    }

    new_topology
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, replication: i64, memory_mb: u64, hosts: &[&str]) -> TaskDemand {
        TaskDemand {
            name: name.to_string(),
            replication,
            memory_mb,
            matched_hosts: hosts.iter().map(|h| h.to_string()).collect(),
        }
    }

    fn topology(entries: &[(&str, &[&str])]) -> Topology {
        entries
            .iter()
            .map(|(host, apps)| {
                (
                    host.to_string(),
                    apps.iter().map(|a| a.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn non_positive_replication_is_skipped() {
        let tasks = vec![
            task("zero", 0, 64, &["h1"]),
            task("negative", -2, 64, &["h1"]),
        ];
        let result = schedule(&tasks, &Topology::new());
        assert!(result.is_empty());
    }

    #[test]
    fn fill_prefers_least_loaded_hosts() {
        // h3 already carries a retained task; web's two replicas land on
        // the empty hosts.
        let tasks = vec![
            task("other", 1, 128, &["h3"]),
            task("web", 2, 64, &["h1", "h2", "h3"]),
        ];
        let old = topology(&[("h3", &["other"])]);

        let result = schedule(&tasks, &old);

        assert_eq!(
            result,
            topology(&[("h1", &["web"]), ("h2", &["web"]), ("h3", &["other"])])
        );
    }

    #[test]
    fn retained_assignment_beats_better_host() {
        // h2 is completely idle, but web already runs on h1 and h1 still
        // matches, so it stays put.
        let tasks = vec![task("web", 1, 64, &["h1", "h2"])];
        let old = topology(&[("h1", &["web"])]);

        let result = schedule(&tasks, &old);

        assert_eq!(result, topology(&[("h1", &["web"])]));
    }

    #[test]
    fn retained_host_no_longer_matching_is_replaced() {
        let tasks = vec![task("web", 1, 64, &["h2"])];
        let old = topology(&[("h1", &["web"])]);

        let result = schedule(&tasks, &old);

        assert_eq!(result, topology(&[("h2", &["web"])]));
    }

    #[test]
    fn memory_breaks_app_count_ties() {
        // heavy and light retain one assignment each, so h1 and h2 both
        // carry one app; h2's is lighter, so the new task goes there.
        let tasks = vec![
            task("heavy", 1, 1024, &["h1"]),
            task("light", 1, 64, &["h2"]),
            task("web", 1, 64, &["h1", "h2"]),
        ];
        let old = topology(&[("h1", &["heavy"]), ("h2", &["light"])]);

        let result = schedule(&tasks, &old);

        assert!(result["h2"].contains("web"));
        assert!(!result["h1"].contains("web"));
    }

    #[test]
    fn hostname_breaks_full_ties() {
        let tasks = vec![task("web", 1, 64, &["h2", "h1", "h3"])];
        let result = schedule(&tasks, &Topology::new());
        assert_eq!(result, topology(&[("h1", &["web"])]));
    }

    #[test]
    fn shortfall_assigns_what_is_available() {
        let tasks = vec![task("web", 5, 64, &["h1", "h2"])];
        let result = schedule(&tasks, &Topology::new());
        assert_eq!(result, topology(&[("h1", &["web"]), ("h2", &["web"])]));
    }

    #[test]
    fn schedule_is_deterministic() {
        let tasks = vec![
            task("a", 2, 256, &["h1", "h2", "h3"]),
            task("b", 1, 64, &["h2", "h3"]),
            task("c", 3, 128, &["h1", "h3"]),
        ];
        let old = topology(&[("h2", &["a"]), ("h3", &["c"])]);

        let first = schedule(&tasks, &old);
        for _ in 0..10 {
            assert_eq!(schedule(&tasks, &old), first);
        }
    }

    #[test]
    fn stability_and_fill_compose() {
        // One replica retained on h1, the second fills onto the idle h3
        // rather than h2 which just received "db".
        let tasks = vec![
            task("db", 1, 512, &["h2"]),
            task("web", 2, 64, &["h1", "h2", "h3"]),
        ];
        let old = topology(&[("h1", &["web"]), ("h2", &["db"])]);

        let result = schedule(&tasks, &old);

        assert_eq!(
            result,
            topology(&[("h1", &["web"]), ("h2", &["db"]), ("h3", &["web"])])
        );
    }
}
