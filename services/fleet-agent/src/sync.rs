//! Resync handlers driven by the watch loops.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::appmgr::AppManager;
use crate::security::SecurityState;
use crate::store::KvClient;

/// Reconciles this host's apps against its topology record.
pub struct TopologySyncer {
    kv: Arc<KvClient>,
    apps: Arc<AppManager>,
    node_name: String,
    health_port: u16,
}

impl TopologySyncer {
    pub fn new(
        kv: Arc<KvClient>,
        apps: Arc<AppManager>,
        node_name: impl Into<String>,
        health_port: u16,
    ) -> Self {
        Self {
            kv,
            apps,
            node_name: node_name.into(),
            health_port,
        }
    }

    /// Converge local apps to the host's topology record and keep the
    /// service catalog in step.
    ///
    /// A transport failure is not an empty topology: it leaves running
    /// apps untouched. Only an explicit empty or absent record for this
    /// host authorizes removing its cluster-managed apps.
    pub async fn sync_node_topology(&self) -> Result<()> {
        let desired = match self.kv.retrieve_host_topology(&self.node_name).await {
            Ok(desired) => desired,
            Err(e) => {
                warn!(error = %e, "topology fetch failed, keeping local apps");
                return Ok(());
            }
        };

        let tasks = match self.kv.retrieve_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                // Installs will be skipped for lack of descriptors, but
                // apps still assigned to this host stay up.
                warn!(error = %e, "task fetch failed");
                BTreeMap::new()
            }
        };

        let outcome = self.apps.apply_topology(desired, &tasks).await;

        for (name, port) in &outcome.installed {
            let Some(port) = port else { continue };
            if let Err(e) = self
                .kv
                .register_service(&self.node_name, name, *port, self.health_port)
                .await
            {
                warn!(app = %name, error = %e, "service registration failed");
            }
        }
        for name in &outcome.removed {
            if let Err(e) = self.kv.deregister_service(&self.node_name, name).await {
                warn!(app = %name, error = %e, "service deregistration failed");
            }
        }

        Ok(())
    }
}

/// Applies security document updates from the store.
pub struct SecuritySyncer {
    kv: Arc<KvClient>,
    state: Arc<SecurityState>,
}

impl SecuritySyncer {
    pub fn new(kv: Arc<KvClient>, state: Arc<SecurityState>) -> Self {
        Self { kv, state }
    }

    pub async fn sync_security(&self) -> Result<()> {
        match self.kv.load_security().await {
            Ok(Some((index, doc))) => {
                self.state.apply(index, doc).await;
            }
            Ok(None) => debug!("no security document in store"),
            Err(e) => warn!(error = %e, "security fetch failed"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::{AppDefinition, TaskRecord};
    use crate::supervisor::{AppRuntime, MockRuntime};
    use base64::Engine as _;
    use serde_json::json;
    use std::collections::BTreeSet;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn encode(value: &serde_json::Value) -> String {
        base64::engine::general_purpose::STANDARD.encode(value.to_string())
    }

    fn task(name: &str) -> TaskRecord {
        TaskRecord {
            replication: 1,
            condition: BTreeMap::new(),
            port: None,
            content: AppDefinition {
                name: name.to_string(),
                command: "./run".to_string(),
                run_as: None,
                working_dir: None,
                env: BTreeMap::new(),
                resource_limit: None,
                docker_image: None,
            },
        }
    }

    async fn seeded_manager(runtime: Arc<MockRuntime>) -> Arc<AppManager> {
        let apps = Arc::new(AppManager::new(runtime));
        let tasks = BTreeMap::from([("web".to_string(), task("web"))]);
        apps.apply_topology(Some(BTreeSet::from(["web".to_string()])), &tasks)
            .await;
        apps
    }

    #[tokio::test]
    async fn transport_failure_keeps_local_apps() {
        let runtime = Arc::new(MockRuntime::new());
        let apps = seeded_manager(Arc::clone(&runtime)).await;

        let kv = Arc::new(KvClient::new("http://127.0.0.1:1"));
        let syncer = TopologySyncer::new(kv, Arc::clone(&apps), "h1", 6060);

        syncer.sync_node_topology().await.unwrap();

        assert_eq!(apps.installed().await, vec!["web".to_string()]);
        assert!(runtime.stopped().await.is_empty());
    }

    #[tokio::test]
    async fn absent_record_removes_cluster_apps() {
        let runtime = Arc::new(MockRuntime::new());
        let apps = seeded_manager(Arc::clone(&runtime)).await;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/fleet/topology/h1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/fleet/task"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/deregister/h1:web"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let kv = Arc::new(KvClient::new(server.uri()));
        let syncer = TopologySyncer::new(kv, Arc::clone(&apps), "h1", 6060);

        syncer.sync_node_topology().await.unwrap();

        assert!(apps.installed().await.is_empty());
        assert_eq!(runtime.stopped().await, vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn assigned_app_is_installed_and_registered() {
        let runtime = Arc::new(MockRuntime::new());
        let apps = Arc::new(AppManager::new(
            Arc::clone(&runtime) as Arc<dyn crate::supervisor::AppRuntime>
        ));

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/fleet/topology/h1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Key": "fleet/topology/h1", "Value": encode(&json!(["web"])), "ModifyIndex": 4}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/fleet/task"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Key": "fleet/task/web", "Value": encode(&json!({
                    "replication": 1,
                    "port": 8080,
                    "content": {"name": "web", "command": "./serve"}
                })), "ModifyIndex": 5}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/register"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(1)
            .mount(&server)
            .await;

        let kv = Arc::new(KvClient::new(server.uri()));
        let syncer = TopologySyncer::new(kv, Arc::clone(&apps), "h1", 6060);

        syncer.sync_node_topology().await.unwrap();

        assert_eq!(apps.installed().await, vec!["web".to_string()]);
        assert!(runtime.running("web").await);
    }

    #[tokio::test]
    async fn security_sync_applies_newer_documents() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/fleet/security"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Key": "fleet/security", "Value": encode(&json!({
                    "users": {"alice": {"key": "k1", "roles": ["admin"]}}
                })), "ModifyIndex": 12}
            ])))
            .mount(&server)
            .await;

        let kv = Arc::new(KvClient::new(server.uri()));
        let state = Arc::new(SecurityState::new());
        let syncer = SecuritySyncer::new(kv, Arc::clone(&state));

        syncer.sync_security().await.unwrap();

        assert_eq!(state.last_index(), 12);
        assert!(state.current().await.users.contains_key("alice"));
    }
}
