//! The leader's scheduling cycle.
//!
//! Every cycle: verify the session, re-acquire the scheduling lock, and
//! — only while holding it — retrieve tasks/nodes/topology, compute the
//! new placement, and publish the minimal diff. Store failures resolve
//! to empty snapshots before the pure placement code runs, so the
//! scheduler itself never sees an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_placement::{diff_topology, fresh_hosts, match_hosts, schedule, TaskDemand, Topology};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::store::{KvClient, LeaderElector, SessionManager};

pub struct Coordinator {
    kv: Arc<KvClient>,
    sessions: Arc<SessionManager>,
    elector: LeaderElector,
    schedule_interval: Duration,
    report_interval_secs: i64,
}

impl Coordinator {
    pub fn new(
        kv: Arc<KvClient>,
        sessions: Arc<SessionManager>,
        elector: LeaderElector,
        schedule_interval: Duration,
        report_interval_secs: i64,
    ) -> Self {
        Self {
            kv,
            sessions,
            elector,
            schedule_interval,
            report_interval_secs,
        }
    }

    /// Run scheduling cycles until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.schedule_interval.as_secs(),
            "scheduling loop started"
        );
        let mut interval = tokio::time::interval(self.schedule_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => self.run_cycle().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduling loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One election-plus-scheduling pass.
    pub async fn run_cycle(&self) {
        if self.sessions.current().await.is_empty() {
            debug!("no session, skipping scheduling cycle");
            return;
        }
        if !self.elector.elect().await {
            debug!("not the leader this cycle");
            return;
        }
        self.leader_schedule().await;
    }

    async fn leader_schedule(&self) {
        let tasks = self.kv.retrieve_tasks().await.unwrap_or_else(|e| {
            warn!(error = %e, "task retrieval failed, scheduling over empty set");
            Default::default()
        });
        let nodes = self.kv.retrieve_nodes().await.unwrap_or_else(|e| {
            warn!(error = %e, "node retrieval failed");
            Default::default()
        });
        let old_topology = self.kv.retrieve_topology().await.unwrap_or_else(|e| {
            warn!(error = %e, "topology retrieval failed, assuming empty");
            Topology::new()
        });

        if nodes.is_empty() {
            debug!("no reporting nodes, nothing to schedule");
            return;
        }

        let hosts = fresh_hosts(nodes, Utc::now().timestamp(), self.report_interval_secs);
        let matched = match_hosts(
            tasks.iter().map(|(name, task)| (name.as_str(), &task.condition)),
            &hosts,
        );

        let demands: Vec<TaskDemand> = tasks
            .iter()
            .map(|(name, task)| TaskDemand {
                name: name.clone(),
                replication: task.replication,
                memory_mb: task
                    .content
                    .resource_limit
                    .as_ref()
                    .map(|limit| limit.memory_mb)
                    .unwrap_or(0),
                matched_hosts: matched.get(name).cloned().unwrap_or_default(),
            })
            .collect();

        let new_topology = schedule(&demands, &old_topology);
        let delta = diff_topology(&old_topology, &new_topology);
        if delta.is_empty() {
            debug!("topology unchanged");
            return;
        }

        // Best-effort per host: one failed write must not block the rest.
        for (host, apps) in &delta.writes {
            match self.kv.write_topology(host, Some(apps)).await {
                Ok(_) => info!(host = %host, apps = apps.len(), "topology written"),
                Err(e) => warn!(host = %host, error = %e, "topology write failed"),
            }
        }
        for host in &delta.deletes {
            match self.kv.write_topology(host, None).await {
                Ok(_) => info!(host = %host, "topology deleted"),
                Err(e) => warn!(host = %host, error = %e, "topology delete failed"),
            }
        }
    }
}
