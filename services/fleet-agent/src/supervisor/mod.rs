//! Process and container supervision.
//!
//! - `AppProcess`: one supervised process, native or container-backed —
//!   selected by whether the app declares a docker image
//! - `AppRuntime`: the lifecycle seam the app manager drives; the real
//!   `ProcessRuntime` keeps one `AppProcess` per app, `MockRuntime`
//!   backs the tests
//! - `native` / `docker` / `cgroup` / `output`: the concrete machinery

pub mod cgroup;
pub mod docker;
pub mod native;
pub mod output;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::store::records::AppDefinition;
use docker::DockerProcess;
use native::NativeProcess;

pub use docker::PLACEHOLDER_PID;

/// One supervised process. The variants share the same capability
/// surface: spawn, liveness, group teardown, output fetch.
#[derive(Clone)]
pub enum AppProcess {
    Native(NativeProcess),
    Docker(DockerProcess),
}

impl AppProcess {
    /// Spawn the right variant for the app.
    pub async fn spawn(app: &AppDefinition, cgroup_root: &std::path::Path) -> Result<Self> {
        if app.docker_image.is_some() {
            Ok(Self::Docker(DockerProcess::spawn(app).await?))
        } else {
            Ok(Self::Native(NativeProcess::spawn(app, cgroup_root).await?))
        }
    }

    /// The attached pid; `None` before a container resolves its root
    /// pid or after teardown.
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Native(p) => p.pid(),
            Self::Docker(p) => p.pid(),
        }
    }

    /// Non-blocking liveness check.
    pub fn running(&self) -> bool {
        match self {
            Self::Native(p) => p.running(),
            Self::Docker(p) => p.running(),
        }
    }

    /// Kill the whole process tree and detach. Idempotent.
    pub async fn killgroup(&self) {
        match self {
            Self::Native(p) => p.killgroup(),
            Self::Docker(p) => p.killgroup().await,
        }
    }

    /// Output produced since the previous fetch.
    pub async fn fetch_output(&self) -> String {
        match self {
            Self::Native(p) => p.fetch_output(),
            Self::Docker(p) => p.fetch_output().await,
        }
    }
}

/// Lifecycle operations the app manager needs from the host.
#[async_trait]
pub trait AppRuntime: Send + Sync {
    /// Start (or restart) an app; returns the pid, which may be the
    /// placeholder for container spawns still in flight.
    async fn start(&self, app: &AppDefinition) -> Result<u32>;

    /// Stop an app and tear down its process tree.
    async fn stop(&self, name: &str) -> Result<()>;

    /// Non-blocking liveness check by app name.
    async fn running(&self, name: &str) -> bool;

    /// Output produced since the previous fetch.
    async fn fetch_output(&self, name: &str) -> String;
}

/// The production runtime: one supervised `AppProcess` per app name.
pub struct ProcessRuntime {
    cgroup_root: PathBuf,
    processes: RwLock<HashMap<String, AppProcess>>,
}

impl ProcessRuntime {
    pub fn new(cgroup_root: PathBuf) -> Self {
        Self {
            cgroup_root,
            processes: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AppRuntime for ProcessRuntime {
    async fn start(&self, app: &AppDefinition) -> Result<u32> {
        // Replacing an app always tears the old tree down first.
        let old = self.processes.write().await.remove(&app.name);
        if let Some(old) = old {
            old.killgroup().await;
        }

        let process = AppProcess::spawn(app, &self.cgroup_root).await?;
        let pid = process.pid().unwrap_or(PLACEHOLDER_PID);
        self.processes
            .write()
            .await
            .insert(app.name.clone(), process);
        info!(app = %app.name, pid, "app started");
        Ok(pid)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let process = self.processes.write().await.remove(name);
        if let Some(process) = process {
            process.killgroup().await;
            info!(app = name, "app stopped");
        } else {
            debug!(app = name, "stop for unknown app ignored");
        }
        Ok(())
    }

    async fn running(&self, name: &str) -> bool {
        let processes = self.processes.read().await;
        processes.get(name).is_some_and(AppProcess::running)
    }

    async fn fetch_output(&self, name: &str) -> String {
        let process = {
            let processes = self.processes.read().await;
            processes.get(name).cloned()
        };
        match process {
            Some(process) => process.fetch_output().await,
            None => String::new(),
        }
    }
}

/// Mock runtime for tests: records lifecycle calls, no real processes.
pub struct MockRuntime {
    fail_starts: bool,
    started: RwLock<Vec<AppDefinition>>,
    stopped: RwLock<Vec<String>>,
    running: RwLock<HashMap<String, AppDefinition>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            fail_starts: false,
            started: RwLock::new(Vec::new()),
            stopped: RwLock::new(Vec::new()),
            running: RwLock::new(HashMap::new()),
        }
    }

    /// A runtime whose every start fails.
    pub fn failing() -> Self {
        Self {
            fail_starts: true,
            ..Self::new()
        }
    }

    pub async fn started(&self) -> Vec<AppDefinition> {
        self.started.read().await.clone()
    }

    pub async fn stopped(&self) -> Vec<String> {
        self.stopped.read().await.clone()
    }

    pub async fn running_apps(&self) -> Vec<String> {
        let mut names: Vec<String> = self.running.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AppRuntime for MockRuntime {
    async fn start(&self, app: &AppDefinition) -> Result<u32> {
        if self.fail_starts {
            anyhow::bail!("mock runtime configured to fail");
        }
        self.started.write().await.push(app.clone());
        self.running
            .write()
            .await
            .insert(app.name.clone(), app.clone());
        Ok(42)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.stopped.write().await.push(name.to_string());
        self.running.write().await.remove(name);
        Ok(())
    }

    async fn running(&self, name: &str) -> bool {
        self.running.read().await.contains_key(name)
    }

    async fn fetch_output(&self, name: &str) -> String {
        format!("[mock] output for {name}")
    }
}
