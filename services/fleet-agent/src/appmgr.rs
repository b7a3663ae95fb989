//! Local application registry and topology reconciliation.
//!
//! Tracks which apps are installed on this host and converges them
//! against the host's topology record. The decision (`plan_sync`) is a
//! pure function over snapshots; `AppManager::apply_topology` executes
//! the plan through the `AppRuntime` seam, one app at a time, so a
//! single failing app never blocks the rest.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::store::records::{AppDefinition, TaskRecord};
use crate::supervisor::AppRuntime;

/// One installed app.
#[derive(Debug, Clone)]
pub struct ManagedApp {
    pub definition: AppDefinition,
    /// True when the install came from topology assignment; only such
    /// apps may be removed by topology sync.
    pub cluster_managed: bool,
    /// Service port published for the app, when its task declares one.
    pub service_port: Option<u16>,
}

/// Actions one sync pass will take.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Apps to (re)install: definition plus service port.
    pub install: Vec<(AppDefinition, Option<u16>)>,
    /// Cluster-managed apps to remove.
    pub remove: Vec<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.remove.is_empty()
    }
}

/// What a sync pass actually did; the caller registers/deregisters
/// service entries accordingly.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub installed: Vec<(String, Option<u16>)>,
    pub removed: Vec<String>,
}

/// Decide installs and removals from the desired app set.
///
/// A desired app is (re)installed when it is not running or when its
/// stored descriptor differs by value from the installed one. Apps
/// without a task record are skipped. Statically installed apps are
/// never removed here.
pub fn plan_sync(
    desired: &BTreeSet<String>,
    tasks: &BTreeMap<String, TaskRecord>,
    installed: &HashMap<String, ManagedApp>,
    running: &BTreeSet<String>,
) -> SyncPlan {
    let mut plan = SyncPlan::default();

    for name in desired {
        let Some(task) = tasks.get(name) else {
            warn!(app = %name, "assigned app has no task record");
            continue;
        };
        match installed.get(name) {
            Some(current) if current.definition == task.content && running.contains(name) => {
                debug!(app = %name, "app already running with current descriptor");
            }
            Some(_) | None => plan.install.push((task.content.clone(), task.port)),
        }
    }

    for (name, app) in installed {
        if app.cluster_managed && !desired.contains(name) {
            plan.remove.push(name.clone());
        }
    }
    plan.remove.sort();

    plan
}

/// Registry of locally installed apps.
pub struct AppManager {
    runtime: Arc<dyn AppRuntime>,
    apps: RwLock<HashMap<String, ManagedApp>>,
}

impl AppManager {
    pub fn new(runtime: Arc<dyn AppRuntime>) -> Self {
        Self {
            runtime,
            apps: RwLock::new(HashMap::new()),
        }
    }

    /// Names of installed apps, sorted.
    pub async fn installed(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apps.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Install an app outside topology control; topology sync will not
    /// remove it.
    pub async fn install_static(&self, definition: AppDefinition) -> anyhow::Result<()> {
        self.runtime.start(&definition).await?;
        self.apps.write().await.insert(
            definition.name.clone(),
            ManagedApp {
                definition,
                cluster_managed: false,
                service_port: None,
            },
        );
        Ok(())
    }

    /// Non-blocking liveness check for one app.
    pub async fn running(&self, name: &str) -> bool {
        self.runtime.running(name).await
    }

    /// Output produced by an app since the previous fetch.
    pub async fn fetch_output(&self, name: &str) -> String {
        self.runtime.fetch_output(name).await
    }

    /// Converge installed apps against the host's desired set.
    ///
    /// `desired` of `None` means the topology record for this host is
    /// explicitly absent, which removes every cluster-managed app. A
    /// store transport failure must not reach this method.
    pub async fn apply_topology(
        &self,
        desired: Option<BTreeSet<String>>,
        tasks: &BTreeMap<String, TaskRecord>,
    ) -> SyncOutcome {
        let desired = desired.unwrap_or_default();
        let plan = {
            let apps = self.apps.read().await;
            let mut running = BTreeSet::new();
            for name in apps.keys() {
                if self.runtime.running(name).await {
                    running.insert(name.clone());
                }
            }
            plan_sync(&desired, tasks, &apps, &running)
        };
        if plan.is_empty() {
            debug!("topology sync: nothing to do");
            return SyncOutcome::default();
        }

        let mut outcome = SyncOutcome::default();

        for name in &plan.remove {
            if let Err(e) = self.runtime.stop(name).await {
                warn!(app = %name, error = %e, "app stop failed");
            }
            self.apps.write().await.remove(name);
            info!(app = %name, "cluster app removed");
            outcome.removed.push(name.clone());
        }

        for (definition, port) in plan.install {
            let name = definition.name.clone();
            match self.runtime.start(&definition).await {
                Ok(pid) => {
                    self.apps.write().await.insert(
                        name.clone(),
                        ManagedApp {
                            definition,
                            cluster_managed: true,
                            service_port: port,
                        },
                    );
                    info!(app = %name, pid, "cluster app installed");
                    outcome.installed.push((name, port));
                }
                Err(e) => {
                    // Not retried here; the next topology sync will try
                    // again since the registry was left unchanged.
                    error!(app = %name, error = %e, "cluster app install failed");
                }
            }
        }

        outcome
    }
}
