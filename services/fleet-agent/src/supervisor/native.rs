//! Native (non-container) process supervision.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::cgroup::CgroupScope;
use super::output::OutputRing;
use crate::store::records::AppDefinition;

/// Lines of recent output kept per process.
const OUTPUT_RING_LINES: usize = 256;

/// A supervised child process running in its own process group.
///
/// The handle is cheap to clone; all state lives behind an `Arc` so the
/// output reader task stays valid however long the owner lives.
#[derive(Clone)]
pub struct NativeProcess {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    /// Leader pid; 0 after `killgroup` detached.
    pid: AtomicI32,
    child: Mutex<Option<tokio::process::Child>>,
    output: Mutex<OutputRing>,
    cgroup: Mutex<Option<CgroupScope>>,
}

impl NativeProcess {
    /// Spawn the app's command in a fresh process group, attach it to a
    /// resource-limited cgroup, and start capturing its output.
    pub async fn spawn(app: &AppDefinition, cgroup_root: &Path) -> Result<Self> {
        let mut parts = app.command.split_whitespace();
        let program = parts
            .next()
            .with_context(|| format!("app {} has an empty command", app.name))?;

        let mut command = Command::new(program);
        command
            .args(parts)
            .envs(&app.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = &app.working_dir {
            command.current_dir(dir);
        }
        if let Some(user) = &app.run_as {
            match resolve_user(user) {
                Some((uid, gid)) => {
                    command.uid(uid).gid(gid);
                }
                None => warn!(app = %app.name, user = %user, "unknown run-as user, keeping agent user"),
            }
        }

        let cgroup = match &app.resource_limit {
            Some(limit) => Some(CgroupScope::create(cgroup_root, &app.name, limit)?),
            None => None,
        };

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning app {}: {}", app.name, app.command))?;
        let pid = child
            .id()
            .with_context(|| format!("app {} exited before a pid was known", app.name))?;

        if let Some(cgroup) = &cgroup {
            if let Err(e) = cgroup.attach(pid) {
                warn!(app = %app.name, pid, error = %e, "cgroup attach failed");
            }
        }

        let inner = Arc::new(Inner {
            name: app.name.clone(),
            pid: AtomicI32::new(pid as i32),
            child: Mutex::new(None),
            output: Mutex::new(OutputRing::new(OUTPUT_RING_LINES)),
            cgroup: Mutex::new(cgroup),
        });

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_lines(stdout, Arc::clone(&inner)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_lines(stderr, Arc::clone(&inner)));
        }
        *inner.child.lock().unwrap() = Some(child);

        info!(app = %app.name, pid, "process started");
        Ok(Self { inner })
    }

    /// The leader pid, if the process was started and not yet detached.
    pub fn pid(&self) -> Option<u32> {
        match self.inner.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid as u32),
        }
    }

    /// Non-blocking liveness check; reaps the child when it has exited.
    pub fn running(&self) -> bool {
        let mut guard = self.inner.child.lock().unwrap();
        let Some(child) = guard.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(app = %self.inner.name, %status, "process exited");
                *guard = None;
                false
            }
            Err(e) => {
                warn!(app = %self.inner.name, error = %e, "liveness check failed");
                false
            }
        }
    }

    /// Kill the whole process group and detach.
    ///
    /// Idempotent: safe on an already-dead or never-started process.
    pub fn killgroup(&self) {
        let pid = self.inner.pid.swap(0, Ordering::SeqCst);
        if pid > 0 {
            // The child was spawned as a process-group leader, so the
            // negative pid addresses the entire tree.
            let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
            if rc != 0 {
                debug!(app = %self.inner.name, pid, "process group already gone");
            } else {
                info!(app = %self.inner.name, pid, "process group killed");
            }
        }
        if let Ok(mut guard) = self.inner.child.lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
            *guard = None;
        }
        if let Some(cgroup) = self.inner.cgroup.lock().unwrap().take() {
            cgroup.remove();
        }
    }

    /// Output lines not yet delivered, joined with newlines.
    pub fn fetch_output(&self) -> String {
        self.inner.output.lock().unwrap().fetch_new().join("\n")
    }
}

async fn read_lines(stream: impl tokio::io::AsyncRead + Unpin, inner: Arc<Inner>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        inner.output.lock().unwrap().push(line);
    }
}

fn resolve_user(name: &str) -> Option<(u32, u32)> {
    let cname = std::ffi::CString::new(name).ok()?;
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        None
    } else {
        unsafe { Some(((*pw).pw_uid, (*pw).pw_gid)) }
    }
}
