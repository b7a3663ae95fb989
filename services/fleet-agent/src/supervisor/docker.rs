//! Container-backed process supervision.
//!
//! Drives the container engine exclusively through its CLI with a fixed
//! protocol per spawn:
//!
//! 1. force-remove any stale container with the app's name
//! 2. inspect the image; pull it first when absent
//! 3. `run -d` with env/resource flags and capture the container id
//! 4. resolve the container's root pid and attach to it
//!
//! Every CLI round-trip takes seconds, so the whole protocol runs on a
//! spawned task; the caller gets a placeholder handle immediately and
//! polls `running()` for the outcome.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::store::records::AppDefinition;

/// Pid handed back while the spawn protocol is still in flight.
pub const PLACEHOLDER_PID: u32 = 1;

/// Env var whose value is appended verbatim as CLI arguments
/// (port/volume mappings and the like) instead of as `-e`.
pub const DOCKER_OPTS_ENV: &str = "FLEET_DOCKER_OPTS";

/// Env var overriding the image pull timeout, in seconds.
pub const PULL_TIMEOUT_ENV: &str = "FLEET_DOCKER_PULL_TIMEOUT";

/// Bound for every CLI step except the image pull.
const CLI_TIMEOUT: Duration = Duration::from_secs(5);

/// Shorter bound for teardown, before the cleanup process itself is
/// killed.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(3);

const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Handle to a container-backed app.
#[derive(Clone)]
pub struct DockerProcess {
    inner: Arc<Inner>,
}

struct Inner {
    app_name: String,
    /// Current container id; taken-and-cleared on teardown so two
    /// concurrent `killgroup` calls cannot both remove it.
    container_id: Mutex<String>,
    /// Host-visible root pid of the container; 0 until resolved.
    attached_pid: AtomicI32,
    /// Pid of an in-flight `docker pull`, killed on teardown.
    pull_pid: AtomicI32,
    /// True while the spawn protocol task is still working.
    constructing: AtomicBool,
    /// Set when the protocol ended without a usable container.
    failed: AtomicBool,
    /// Watermark for `docker logs --since`.
    last_fetch: Mutex<DateTime<Utc>>,
}

impl DockerProcess {
    /// Launch the spawn protocol on its own task and return as soon as
    /// that task has started. The real pid appears later; poll
    /// `running()`.
    pub async fn spawn(app: &AppDefinition) -> Result<Self> {
        let image = app
            .docker_image
            .clone()
            .with_context(|| format!("app {} has no docker image", app.name))?;

        let inner = Arc::new(Inner {
            app_name: app.name.clone(),
            container_id: Mutex::new(String::new()),
            attached_pid: AtomicI32::new(0),
            pull_pid: AtomicI32::new(0),
            constructing: AtomicBool::new(true),
            failed: AtomicBool::new(false),
            last_fetch: Mutex::new(Utc::now()),
        });

        let (started_tx, started_rx) = oneshot::channel();
        let task_inner = Arc::clone(&inner);
        let app = app.clone();
        tokio::spawn(async move {
            // Rendezvous: release the caller only once this task runs.
            let _ = started_tx.send(());

            if let Err(e) = run_spawn_protocol(&task_inner, &app, &image).await {
                error!(app = %task_inner.app_name, error = %e, "container start failed");
                task_inner.failed.store(true, Ordering::SeqCst);
                teardown(&task_inner).await;
            }
            task_inner.constructing.store(false, Ordering::SeqCst);
        });
        let _ = started_rx.await;

        Ok(Self { inner })
    }

    /// The container's host-visible root pid, once resolved.
    pub fn pid(&self) -> Option<u32> {
        match self.inner.attached_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid as u32),
        }
    }

    /// True while the protocol is in flight or the attached pid is
    /// alive.
    pub fn running(&self) -> bool {
        if self.inner.constructing.load(Ordering::SeqCst) {
            return true;
        }
        match self.inner.attached_pid.load(Ordering::SeqCst) {
            0 => false,
            pid => unsafe { libc::kill(pid, 0) == 0 },
        }
    }

    /// True when the spawn protocol gave up.
    pub fn failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    pub async fn container_id(&self) -> String {
        self.inner.container_id.lock().await.clone()
    }

    /// Remove the container, kill any in-flight pull, and detach.
    /// Idempotent; safe on a never-spawned instance.
    pub async fn killgroup(&self) {
        teardown(&self.inner).await;
    }

    /// Container log lines since the previous fetch.
    pub async fn fetch_output(&self) -> String {
        let container_id = self.inner.container_id.lock().await.clone();
        if container_id.is_empty() {
            return String::new();
        }
        let since = {
            let mut guard = self.inner.last_fetch.lock().await;
            let since = guard.to_rfc3339_opts(SecondsFormat::Secs, true);
            *guard = Utc::now();
            since
        };
        match docker_cli(
            &["logs".to_string(), "--since".to_string(), since, container_id],
            CLI_TIMEOUT,
        )
        .await
        {
            Ok((_, output)) => output,
            Err(e) => {
                warn!(app = %self.inner.app_name, error = %e, "log fetch failed");
                String::new()
            }
        }
    }
}

async fn run_spawn_protocol(inner: &Arc<Inner>, app: &AppDefinition, image: &str) -> Result<()> {
    let container_name = &inner.app_name;

    // A container with our name may survive a daemon restart.
    let _ = docker_cli(
        &["rm".to_string(), "-f".to_string(), container_name.clone()],
        CLI_TIMEOUT,
    )
    .await;

    if !image_present(image).await {
        pull_image(inner, app, image).await?;
    }

    let args = build_run_args(app, image, container_name);
    let (ok, stdout) = docker_cli(&args, CLI_TIMEOUT).await?;
    let container_id = stdout.lines().next().unwrap_or("").trim().to_string();
    if !ok || container_id.is_empty() {
        bail!("container for {container_name} did not start: {stdout}");
    }
    *inner.container_id.lock().await = container_id.clone();
    info!(app = %container_name, container = %container_id, "container started");

    let (ok, stdout) = docker_cli(
        &[
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Pid}}".to_string(),
            container_id.clone(),
        ],
        CLI_TIMEOUT,
    )
    .await?;
    let pid: i32 = stdout.trim().parse().unwrap_or(0);
    if !ok || pid <= 1 {
        bail!("container {container_id} has no resolvable root pid: {stdout}");
    }

    inner.attached_pid.store(pid, Ordering::SeqCst);
    info!(app = %container_name, pid, "attached to container pid");
    Ok(())
}

async fn image_present(image: &str) -> bool {
    match docker_cli(
        &[
            "inspect".to_string(),
            "-f".to_string(),
            "{{.Size}}".to_string(),
            image.to_string(),
        ],
        CLI_TIMEOUT,
    )
    .await
    {
        Ok((true, stdout)) => stdout.trim().parse::<i64>().map(|s| s > 0).unwrap_or(false),
        _ => false,
    }
}

async fn pull_image(inner: &Arc<Inner>, app: &AppDefinition, image: &str) -> Result<()> {
    let timeout = app
        .env
        .get(PULL_TIMEOUT_ENV)
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_PULL_TIMEOUT);
    warn!(app = %inner.app_name, image, timeout_secs = timeout.as_secs(), "image absent, pulling");

    let mut child = Command::new("docker")
        .args(["pull", image])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("spawning docker pull")?;
    if let Some(pid) = child.id() {
        inner.pull_pid.store(pid as i32, Ordering::SeqCst);
    }

    let result = tokio::time::timeout(timeout, child.wait()).await;
    inner.pull_pid.store(0, Ordering::SeqCst);
    match result {
        Ok(Ok(status)) if status.success() => {
            info!(app = %inner.app_name, image, "image pulled");
            Ok(())
        }
        Ok(Ok(status)) => bail!("docker pull {image} exited with {status}"),
        Ok(Err(e)) => Err(e).context("waiting for docker pull"),
        Err(_) => bail!("docker pull {image} timed out"),
    }
}

/// Compose the `docker run` argument vector for an app.
///
/// Each env var becomes its own `-e KEY=VALUE` argument (argv delivery
/// keeps whitespace in values intact), except the reserved options
/// variable whose value is split into raw CLI arguments.
pub fn build_run_args(app: &AppDefinition, image: &str, container_name: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container_name.to_string(),
    ];

    for (key, value) in &app.env {
        if key == DOCKER_OPTS_ENV {
            args.extend(value.split_whitespace().map(str::to_string));
        } else {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
    }

    if let Some(limit) = &app.resource_limit {
        if limit.memory_mb > 0 {
            args.push("--memory".to_string());
            args.push(format!("{}M", limit.memory_mb));
            if limit.memory_virt_mb > limit.memory_mb {
                args.push("--memory-swap".to_string());
                args.push(format!("{}M", limit.memory_virt_mb));
            }
        }
        if limit.cpu_shares > 0 {
            args.push("--cpu-shares".to_string());
            args.push(limit.cpu_shares.to_string());
        }
    }

    args.push(image.to_string());
    args.extend(app.command.split_whitespace().map(str::to_string));
    args
}

async fn teardown(inner: &Arc<Inner>) {
    // Take-and-clear first so a concurrent teardown sees an empty id.
    let container_id = std::mem::take(&mut *inner.container_id.lock().await);
    if !container_id.is_empty() {
        match docker_cli(
            &["rm".to_string(), "-f".to_string(), container_id.clone()],
            TEARDOWN_TIMEOUT,
        )
        .await
        {
            Ok(_) => debug!(container = %container_id, "container removed"),
            Err(e) => warn!(container = %container_id, error = %e, "container removal failed"),
        }
    }

    let pull_pid = inner.pull_pid.swap(0, Ordering::SeqCst);
    if pull_pid > 0 {
        unsafe { libc::kill(pull_pid, libc::SIGKILL) };
        debug!(app = %inner.app_name, pull_pid, "in-flight pull killed");
    }

    inner.attached_pid.store(0, Ordering::SeqCst);
}

/// Run one docker CLI invocation with a bounded wait. The child is
/// killed when the bound elapses (`kill_on_drop`), so a wedged engine
/// cannot leak processes.
async fn docker_cli(args: &[String], timeout: Duration) -> Result<(bool, String)> {
    let mut child = Command::new("docker")
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning docker {}", args.join(" ")))?;

    let mut stdout = child.stdout.take();
    let wait = async {
        let mut buf = String::new();
        if let Some(out) = stdout.as_mut() {
            let _ = out.read_to_string(&mut buf).await;
        }
        let status = child.wait().await?;
        Ok::<_, anyhow::Error>((status.success(), buf))
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => bail!("docker {} timed out after {timeout:?}", args.join(" ")),
    }
}
