//! Typed documents stored in the coordination store.
//!
//! Key layout (all under the `fleet/` KV prefix):
//!
//! - `nodes/<hostname>`: `{resource, label}`, report time in the flags
//! - `task/<name>`: task descriptor (replication, condition, content)
//! - `topology/<hostname>`: JSON array of assigned task names
//! - `security`: the cluster security document
//! - `leader`: the scheduling lock

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use fleet_placement::{HostInfo, Topology};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::http::{KvClient, StoreError};
use crate::resources::ResourceSnapshot;

/// Resource ceilings for one application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimit {
    /// Memory ceiling in MiB; zero means unlimited.
    #[serde(default)]
    pub memory_mb: u64,
    /// Memory+swap ceiling in MiB; only effective when greater than
    /// `memory_mb`.
    #[serde(default)]
    pub memory_virt_mb: u64,
    /// Relative CPU share weight; zero means default.
    #[serde(default)]
    pub cpu_shares: u64,
}

/// The application descriptor carried inside a task.
///
/// Value equality is the change test: a topology-synced app is restarted
/// iff its stored descriptor differs from the installed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDefinition {
    pub name: String,
    pub command: String,
    /// User to run the process as; the agent's own user when absent.
    #[serde(default)]
    pub run_as: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resource_limit: Option<ResourceLimit>,
    /// When present the app runs as a container of this image.
    #[serde(default)]
    pub docker_image: Option<String>,
}

/// A declared workload, as stored under `task/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(default)]
    pub replication: i64,
    /// Label predicate: every pair must appear on a host for it to match.
    #[serde(default)]
    pub condition: BTreeMap<String, String>,
    /// Fixed service port, when the task exposes one.
    #[serde(default)]
    pub port: Option<u16>,
    pub content: AppDefinition,
}

/// The node status report written under `nodes/<hostname>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub resource: ResourceSnapshot,
    pub label: BTreeMap<String, String>,
}

/// One user entry of the cluster security document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityUser {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// The cluster security document synced across the fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityDoc {
    #[serde(default)]
    pub users: BTreeMap<String, SecurityUser>,
}

impl SecurityDoc {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

impl KvClient {
    /// Fetch all declared tasks. Records that do not parse, carry no
    /// name, or declare no replicas are skipped.
    pub async fn retrieve_tasks(&self) -> Result<BTreeMap<String, TaskRecord>, StoreError> {
        let mut tasks = BTreeMap::new();
        for record in self.get_kv_records("task").await? {
            if record.key.trim_end_matches('/') == "fleet/task" {
                continue;
            }
            let task: TaskRecord = match serde_json::from_slice(&record.value) {
                Ok(task) => task,
                Err(e) => {
                    warn!(key = %record.key, error = %e, "skipping unparsable task record");
                    continue;
                }
            };
            if task.content.name.is_empty() || task.replication == 0 {
                continue;
            }
            debug!(task = %task.content.name, replication = task.replication, "retrieved task");
            tasks.insert(task.content.name.clone(), task);
        }
        Ok(tasks)
    }

    /// Fetch every reporting node with its labels and last-report time.
    /// Staleness filtering is the caller's concern.
    pub async fn retrieve_nodes(&self) -> Result<Vec<HostInfo>, StoreError> {
        #[derive(Deserialize)]
        struct NodeValue {
            #[serde(default)]
            label: BTreeMap<String, String>,
        }

        let mut nodes = Vec::new();
        for record in self.get_kv_records("nodes").await? {
            let value: NodeValue = match serde_json::from_slice(&record.value) {
                Ok(value) => value,
                Err(e) => {
                    warn!(key = %record.key, error = %e, "skipping unparsable node record");
                    continue;
                }
            };
            nodes.push(HostInfo {
                hostname: record.leaf().to_string(),
                labels: value.label,
                last_report_ts: record.flags,
            });
        }
        debug!(nodes = nodes.len(), "retrieved nodes");
        Ok(nodes)
    }

    /// Fetch the full published topology (every host's assignment set).
    pub async fn retrieve_topology(&self) -> Result<Topology, StoreError> {
        let mut topology = Topology::new();
        for record in self.get_kv_records("topology").await? {
            let apps: Vec<String> = match serde_json::from_slice(&record.value) {
                Ok(apps) => apps,
                Err(e) => {
                    warn!(key = %record.key, error = %e, "skipping unparsable topology record");
                    continue;
                }
            };
            topology.insert(record.leaf().to_string(), apps.into_iter().collect());
        }
        Ok(topology)
    }

    /// Fetch one host's assignment set. `Ok(None)` means the host has no
    /// record — which authorizes removing its cluster-managed apps,
    /// unlike a transport error, which authorizes nothing.
    pub async fn retrieve_host_topology(
        &self,
        hostname: &str,
    ) -> Result<Option<BTreeSet<String>>, StoreError> {
        let Some(record) = self.get_kv_record(&format!("topology/{hostname}")).await? else {
            return Ok(None);
        };
        let apps: Vec<String> = serde_json::from_slice(&record.value)
            .map_err(|e| StoreError::Decode(format!("{}: {e}", record.key)))?;
        Ok(Some(apps.into_iter().collect()))
    }

    /// Write or delete one host's topology record. Empty assignment sets
    /// are expressed as deletes, never as empty-array writes.
    pub async fn write_topology(
        &self,
        hostname: &str,
        apps: Option<&BTreeSet<String>>,
    ) -> Result<bool, StoreError> {
        match apps {
            Some(apps) if !apps.is_empty() => {
                let body = serde_json::to_value(apps.iter().collect::<Vec<_>>())
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                self.put_kv(&format!("topology/{hostname}"), now_ts(), &body)
                    .await
            }
            _ => self.delete_kv(&format!("topology/{hostname}")).await,
        }
    }

    /// Publish this node's resource/label report, stamping the report
    /// time into the record flags.
    pub async fn report_status(
        &self,
        hostname: &str,
        report: &NodeReport,
    ) -> Result<bool, StoreError> {
        let body = serde_json::to_value(report).map_err(|e| StoreError::Decode(e.to_string()))?;
        self.put_kv(&format!("nodes/{hostname}"), now_ts(), &body)
            .await
    }

    /// Fetch the security document with its modification index.
    pub async fn load_security(&self) -> Result<Option<(u64, SecurityDoc)>, StoreError> {
        let Some(record) = self.get_kv_record("security").await? else {
            return Ok(None);
        };
        let doc: SecurityDoc = serde_json::from_slice(&record.value)
            .map_err(|e| StoreError::Decode(format!("{}: {e}", record.key)))?;
        Ok(Some((record.modify_index, doc)))
    }

    /// Publish the local security document.
    pub async fn save_security(&self, doc: &SecurityDoc) -> Result<bool, StoreError> {
        let body = serde_json::to_value(doc).map_err(|e| StoreError::Decode(e.to_string()))?;
        self.put_kv("security", now_ts(), &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn task_record_deserialization() {
        let json = r#"{
            "replication": 2,
            "condition": {"region": "eu"},
            "port": 8080,
            "content": {
                "name": "web",
                "command": "./serve --port 8080",
                "env": {"MODE": "prod"},
                "resource_limit": {"memory_mb": 256, "cpu_shares": 512},
                "docker_image": "registry.local/web:1"
            }
        }"#;

        let task: TaskRecord = serde_json::from_str(json).unwrap();
        assert_eq!(task.replication, 2);
        assert_eq!(task.port, Some(8080));
        assert_eq!(task.condition["region"], "eu");
        assert_eq!(task.content.name, "web");
        assert_eq!(
            task.content.resource_limit.as_ref().unwrap().memory_mb,
            256
        );
        assert_eq!(
            task.content.docker_image.as_deref(),
            Some("registry.local/web:1")
        );
    }

    #[test]
    fn app_definitions_compare_by_value() {
        let a: AppDefinition =
            serde_json::from_value(json!({"name": "web", "command": "./serve"})).unwrap();
        let mut b = a.clone();
        assert_eq!(a, b);

        b.env.insert("MODE".to_string(), "prod".to_string());
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn nameless_and_zero_replication_tasks_are_skipped() {
        let encode = |v: &serde_json::Value| {
            base64::engine::general_purpose::STANDARD.encode(v.to_string())
        };
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/fleet/task"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Key": "fleet/task/web", "Value": encode(&json!({
                    "replication": 1, "content": {"name": "web", "command": "./run"}
                }))},
                {"Key": "fleet/task/idle", "Value": encode(&json!({
                    "replication": 0, "content": {"name": "idle", "command": "./run"}
                }))},
                {"Key": "fleet/task/broken", "Value": encode(&json!({
                    "replication": 1, "content": {"name": "", "command": "./run"}
                }))}
            ])))
            .mount(&server)
            .await;

        let kv = KvClient::new(server.uri());
        let tasks = kv.retrieve_tasks().await.unwrap();

        assert_eq!(tasks.len(), 1);
        assert!(tasks.contains_key("web"));
    }

    #[tokio::test]
    async fn security_document_round_trip() {
        let doc = SecurityDoc {
            users: BTreeMap::from([(
                "alice".to_string(),
                SecurityUser {
                    key: "k1".to_string(),
                    roles: vec!["admin".to_string()],
                },
            )]),
        };

        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/fleet/security"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(1)
            .mount(&server)
            .await;
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_string(&doc).unwrap());
        Mock::given(method("GET"))
            .and(path("/v1/kv/fleet/security"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Key": "fleet/security", "Value": encoded, "ModifyIndex": 21}
            ])))
            .mount(&server)
            .await;

        let kv = KvClient::new(server.uri());
        assert!(kv.save_security(&doc).await.unwrap());

        let (index, loaded) = kv.load_security().await.unwrap().unwrap();
        assert_eq!(index, 21);
        assert_eq!(loaded, doc);
    }

    #[tokio::test]
    async fn node_report_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/fleet/nodes/h1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .mount(&server)
            .await;

        let kv = KvClient::new(server.uri());
        let report = NodeReport {
            resource: ResourceSnapshot::default(),
            label: BTreeMap::from([("region".to_string(), "eu".to_string())]),
        };
        assert!(kv.report_status("h1", &report).await.unwrap());
    }
}
