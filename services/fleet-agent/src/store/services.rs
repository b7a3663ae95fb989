//! Network service (de)registration for topology-assigned apps.
//!
//! Each assigned task with a fixed port gets a service entry on the
//! local store agent, with an HTTP health check pointing at the app's
//! health endpoint.

use serde::Serialize;
use tracing::debug;

use super::http::{KvClient, StoreError};

#[derive(Debug, Serialize)]
struct ServiceCheck {
    #[serde(rename = "HTTP")]
    http: String,
    #[serde(rename = "Interval")]
    interval: String,
    #[serde(rename = "Timeout")]
    timeout: String,
    #[serde(rename = "Method")]
    method: String,
    #[serde(rename = "TLSSkipVerify")]
    tls_skip_verify: bool,
}

#[derive(Debug, Serialize)]
struct ServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Check")]
    check: ServiceCheck,
}

fn service_id(hostname: &str, app_name: &str) -> String {
    format!("{hostname}:{app_name}")
}

impl KvClient {
    /// Register the service entry for an assigned app. Apps without a
    /// port have nothing to register.
    pub async fn register_service(
        &self,
        hostname: &str,
        app_name: &str,
        port: u16,
        health_port: u16,
    ) -> Result<bool, StoreError> {
        if port == 0 {
            return Ok(false);
        }

        let registration = ServiceRegistration {
            id: service_id(hostname, app_name),
            name: app_name.to_string(),
            address: hostname.to_string(),
            port,
            check: ServiceCheck {
                http: format!("https://{hostname}:{health_port}/app/{app_name}/health"),
                interval: "5s".to_string(),
                timeout: "4s".to_string(),
                method: "GET".to_string(),
                tls_skip_verify: true,
            },
        };
        let body =
            serde_json::to_value(&registration).map_err(|e| StoreError::Decode(e.to_string()))?;
        let text = self
            .put_text(
                "/v1/agent/service/register",
                &[("replace-existing-checks", "true".to_string())],
                Some(&body),
            )
            .await?;
        debug!(app = app_name, port, "service registered");
        Ok(text.trim() == "true" || text.trim().is_empty())
    }

    /// Remove the service entry for an app that left this host.
    pub async fn deregister_service(
        &self,
        hostname: &str,
        app_name: &str,
    ) -> Result<(), StoreError> {
        let path = format!(
            "/v1/agent/service/deregister/{}",
            service_id(hostname, app_name)
        );
        self.put_text(&path, &[], None).await?;
        debug!(app = app_name, "service deregistered");
        Ok(())
    }
}
