//! Configuration for the fleet agent.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;

/// Fleet agent configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's name; the key under which its records are stored.
    pub node_name: String,

    /// Coordination store base URL.
    pub store_url: String,

    /// Labels reported for this host, matched against task conditions.
    pub labels: BTreeMap<String, String>,

    /// Participate in leader election and scheduling.
    pub scheduler: bool,

    /// Run topology-assigned apps on this host.
    pub worker: bool,

    /// Sync the cluster security document.
    pub security_sync: bool,

    /// Session TTL in seconds.
    pub session_ttl_secs: u64,

    /// Node status report interval in seconds.
    pub report_interval_secs: u64,

    /// Scheduling cycle interval in seconds.
    pub schedule_interval_secs: u64,

    /// Long-poll wait per watch iteration, in seconds.
    pub block_wait_secs: u64,

    /// Session id recovered from a previous run, if any.
    pub recovered_session: String,

    /// Port of the local health endpoint baked into service checks.
    pub service_health_port: u16,

    /// Root of the agent's cgroup subtree.
    pub cgroup_root: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let node_name = std::env::var("FLEET_NODE_NAME").ok().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string())
        });

        let store_url = std::env::var("FLEET_STORE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8500".to_string());

        let labels = std::env::var("FLEET_LABELS")
            .map(|raw| parse_labels(&raw))
            .unwrap_or_default();

        Ok(Self {
            node_name,
            store_url,
            labels,
            scheduler: env_flag("FLEET_SCHEDULER", true),
            worker: env_flag("FLEET_WORKER", true),
            security_sync: env_flag("FLEET_SECURITY_SYNC", false),
            session_ttl_secs: env_number("FLEET_SESSION_TTL", 30),
            report_interval_secs: env_number("FLEET_REPORT_INTERVAL", 10),
            schedule_interval_secs: env_number("FLEET_SCHEDULE_INTERVAL", 5),
            block_wait_secs: env_number("FLEET_BLOCK_WAIT", 50),
            recovered_session: std::env::var("FLEET_RECOVERED_SESSION").unwrap_or_default(),
            service_health_port: env_number("FLEET_HEALTH_PORT", 6060),
            cgroup_root: std::env::var("FLEET_CGROUP_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/sys/fs/cgroup/fleet")),
            log_level: std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Sessions shorter than this are not worth renewing; upkeep is
    /// disabled below it.
    pub fn session_upkeep_enabled(&self) -> bool {
        self.session_ttl_secs > 10
    }

    /// Interval between session renewals, comfortably inside the TTL.
    pub fn session_renew_interval_secs(&self) -> u64 {
        self.session_ttl_secs.saturating_sub(3)
    }

    pub fn report_enabled(&self) -> bool {
        self.report_interval_secs > 3
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_number<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse `key=value,key2=value2` label lists.
fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}
