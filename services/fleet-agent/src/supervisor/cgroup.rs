//! cgroup v2 resource limits for native processes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::store::records::ResourceLimit;

const MIB: u64 = 1024 * 1024;

/// A per-app cgroup under the agent's subtree.
///
/// Created before the process launches; the spawned pid is attached via
/// `cgroup.procs` so the limits cover the whole process tree.
#[derive(Debug)]
pub struct CgroupScope {
    path: PathBuf,
}

impl CgroupScope {
    /// Create the cgroup and write the limit files.
    ///
    /// `root` is the agent's cgroup subtree (`/sys/fs/cgroup/fleet` in
    /// production, a temp dir in tests).
    pub fn create(root: &Path, app_name: &str, limit: &ResourceLimit) -> Result<Self> {
        let path = root.join(app_name);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating cgroup {}", path.display()))?;

        if limit.memory_mb > 0 {
            write_limit(&path, "memory.max", &(limit.memory_mb * MIB).to_string())?;
            // The swap file takes the ceiling beyond memory.max; only
            // meaningful when the virtual ceiling exceeds the memory one.
            if limit.memory_virt_mb > limit.memory_mb {
                let swap = (limit.memory_virt_mb - limit.memory_mb) * MIB;
                write_limit(&path, "memory.swap.max", &swap.to_string())?;
            }
        }
        if limit.cpu_shares > 0 {
            write_limit(&path, "cpu.weight", &limit.cpu_shares.to_string())?;
        }

        debug!(cgroup = %path.display(), "cgroup configured");
        Ok(Self { path })
    }

    /// Attach a pid (and thereby its future children) to this cgroup.
    pub fn attach(&self, pid: u32) -> Result<()> {
        write_limit(&self.path, "cgroup.procs", &pid.to_string())
    }

    /// Remove the cgroup directory. Fails silently when processes still
    /// linger; the next create for the same app reuses the directory.
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_dir(&self.path) {
            warn!(cgroup = %self.path.display(), error = %e, "cgroup removal failed");
        }
    }
}

fn write_limit(dir: &Path, file: &str, value: &str) -> Result<()> {
    let path = dir.join(file);
    std::fs::write(&path, value).with_context(|| format!("writing {}", path.display()))
}
