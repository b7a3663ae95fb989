//! Raw HTTP transport for the coordination store.
//!
//! Thin request/response wrapper over the store's KV API. Callers get an
//! explicit error taxonomy: `Ok(None)` means "key absent", `Err` means
//! the store could not be asked. Higher layers decide which of those is
//! safe to treat as "no data".

use std::time::Duration;

use base64::Engine as _;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Prefix for every KV key this system owns.
pub const KV_PREFIX: &str = "/v1/kv/fleet/";

/// Timeout for plain (non-blocking) store calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Slack added on top of the requested long-poll wait.
const BLOCK_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

/// Store access errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or the response never arrived.
    #[error("store transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The store answered with an unexpected status.
    #[error("store returned {status} for {path}")]
    Status { path: String, status: StatusCode },

    /// The response payload was not in the expected shape.
    #[error("store response decode failed: {0}")]
    Decode(String),
}

/// One decoded KV record.
#[derive(Debug, Clone)]
pub struct KvRecord {
    /// Full key as stored, e.g. `fleet/topology/host-1`.
    pub key: String,
    /// Decoded value bytes (base64 on the wire).
    pub value: Vec<u8>,
    /// Record flags; this system stores report timestamps here.
    pub flags: i64,
    /// Monotonically increasing modification index.
    pub modify_index: u64,
}

impl KvRecord {
    /// Last path segment of the key, e.g. the hostname of a topology
    /// record.
    pub fn leaf(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "Flags", default)]
    flags: i64,
    #[serde(rename = "ModifyIndex", default)]
    modify_index: u64,
}

/// Client for the coordination store's HTTP API.
///
/// Constructed once and shared (`Arc<KvClient>`); owns a short-timeout
/// client for regular calls and a separate one for long-polls, whose
/// timeout is derived from the requested wait.
pub struct KvClient {
    client: reqwest::Client,
    watch_client: reqwest::Client,
    base_url: String,
}

impl KvClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        let watch_client = reqwest::Client::builder()
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            watch_client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, StoreError> {
        let mut req = self.client.request(method, self.url(path)).query(query);
        if let Some(body) = body {
            req = req.json(body);
        }
        let response = req.send().await?;
        debug!(path, status = %response.status(), "store request");
        Ok(response)
    }

    fn check_status(path: &str, response: &reqwest::Response) -> Result<(), StoreError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Status {
                path: path.to_string(),
                status: response.status(),
            })
        }
    }

    /// PUT returning the raw response body text (the store answers
    /// `true`/`false` for KV and lock writes).
    pub async fn put_text(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<String, StoreError> {
        let response = self.request(Method::PUT, path, query, body).await?;
        Self::check_status(path, &response)?;
        Ok(response.text().await?)
    }

    /// PUT returning a JSON body (session endpoints).
    pub async fn put_json(
        &self,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, StoreError> {
        let response = self.request(Method::PUT, path, &[], body).await?;
        Self::check_status(path, &response)?;
        Ok(response.json().await?)
    }

    pub async fn delete(&self, path: &str) -> Result<String, StoreError> {
        let response = self.request(Method::DELETE, path, &[], None).await?;
        Self::check_status(path, &response)?;
        Ok(response.text().await?)
    }

    /// Recursive read under a KV prefix. An absent prefix is an empty
    /// list, not an error.
    pub async fn get_kv_records(&self, prefix: &str) -> Result<Vec<KvRecord>, StoreError> {
        let path = format!("{KV_PREFIX}{prefix}");
        let response = self
            .request(Method::GET, &path, &[("recurse", "true".to_string())], None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Self::check_status(&path, &response)?;

        let raw: Vec<RawRecord> = response.json().await?;
        let mut records = Vec::with_capacity(raw.len());
        for record in raw {
            let Some(encoded) = record.value else {
                // The bare-prefix record carries a null value; skip it.
                continue;
            };
            if encoded.is_empty() {
                continue;
            }
            let value = base64::engine::general_purpose::STANDARD
                .decode(&encoded)
                .map_err(|e| StoreError::Decode(format!("{}: {e}", record.key)))?;
            records.push(KvRecord {
                key: record.key,
                value,
                flags: record.flags,
                modify_index: record.modify_index,
            });
        }
        Ok(records)
    }

    /// Read a single KV key. `Ok(None)` means the key does not exist,
    /// which is distinct from the store being unreachable.
    pub async fn get_kv_record(&self, key: &str) -> Result<Option<KvRecord>, StoreError> {
        let path = format!("{KV_PREFIX}{key}");
        let response = self.request(Method::GET, &path, &[], None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check_status(&path, &response)?;

        let raw: Vec<RawRecord> = response.json().await?;
        let Some(record) = raw.into_iter().next() else {
            return Ok(None);
        };
        let Some(encoded) = record.value else {
            return Ok(None);
        };
        if encoded.is_empty() {
            return Ok(None);
        }
        let value = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(|e| StoreError::Decode(format!("{}: {e}", record.key)))?;
        Ok(Some(KvRecord {
            key: record.key,
            value,
            flags: record.flags,
            modify_index: record.modify_index,
        }))
    }

    /// Write a KV key, stamping the report timestamp into the record
    /// flags. The store acknowledges with a literal `true`.
    pub async fn put_kv(
        &self,
        key: &str,
        flags_ts: i64,
        body: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let path = format!("{KV_PREFIX}{key}");
        let text = self
            .put_text(&path, &[("flags", flags_ts.to_string())], Some(body))
            .await?;
        Ok(text.trim() == "true")
    }

    /// Conditional write bound to a session: succeeds iff the lock was
    /// acquired.
    pub async fn put_kv_acquire(
        &self,
        key: &str,
        session_id: &str,
        flags_ts: i64,
        body: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let path = format!("{KV_PREFIX}{key}");
        let text = self
            .put_text(
                &path,
                &[
                    ("acquire", session_id.to_string()),
                    ("flags", flags_ts.to_string()),
                ],
                Some(body),
            )
            .await?;
        Ok(text.trim() == "true")
    }

    pub async fn delete_kv(&self, key: &str) -> Result<bool, StoreError> {
        let path = format!("{KV_PREFIX}{key}");
        let text = self.delete(&path).await?;
        Ok(text.trim() == "true")
    }

    /// Long-poll a KV key until its modification index moves past
    /// `last_index` or the wait elapses.
    ///
    /// Returns the index carried in the response header; `Ok(None)` when
    /// the header is missing or not numeric ("no new index").
    pub async fn block_query(
        &self,
        key: &str,
        last_index: u64,
        wait_secs: u64,
    ) -> Result<Option<u64>, StoreError> {
        let path = format!("{KV_PREFIX}{key}");
        let response = self
            .watch_client
            .get(self.url(&path))
            .query(&[
                ("index", last_index.to_string()),
                ("wait", format!("{wait_secs}s")),
            ])
            .timeout(Duration::from_secs(wait_secs) + BLOCK_TIMEOUT_SLACK)
            .send()
            .await?;

        let Some(header) = response.headers().get("X-Consul-Index") else {
            return Ok(None);
        };
        match header.to_str().ok().and_then(|s| s.parse::<u64>().ok()) {
            Some(index) => Ok(Some(index)),
            None => {
                warn!(key, header = ?header, "non-numeric modify index header");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn encode(value: &serde_json::Value) -> String {
        base64::engine::general_purpose::STANDARD.encode(value.to_string())
    }

    #[tokio::test]
    async fn recurse_read_skips_bare_prefix_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/fleet/task"))
            .and(query_param("recurse", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Key": "fleet/task/", "Value": null, "ModifyIndex": 10},
                {"Key": "fleet/task/web", "Value": encode(&json!({"replication": 2})), "ModifyIndex": 11, "Flags": 0}
            ])))
            .mount(&server)
            .await;

        let kv = KvClient::new(server.uri());
        let records = kv.get_kv_records("task").await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].leaf(), "web");
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&records[0].value).unwrap(),
            json!({"replication": 2})
        );
    }

    #[tokio::test]
    async fn missing_prefix_reads_as_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/fleet/task"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let kv = KvClient::new(server.uri());
        assert!(kv.get_kv_records("task").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_key_read_distinguishes_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/fleet/topology/h1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let kv = KvClient::new(server.uri());
        assert!(kv.get_kv_record("topology/h1").await.unwrap().is_none());

        // An unreachable store is an error, not an absence.
        let kv = KvClient::new("http://127.0.0.1:1");
        assert!(kv.get_kv_record("topology/h1").await.is_err());
    }

    #[tokio::test]
    async fn block_query_parses_index_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/fleet/topology/h1"))
            .and(query_param("index", "5"))
            .and(query_param("wait", "1s"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Consul-Index", "7")
                    .set_body_json(json!([])),
            )
            .mount(&server)
            .await;

        let kv = KvClient::new(server.uri());
        let index = kv.block_query("topology/h1", 5, 1).await.unwrap();
        assert_eq!(index, Some(7));
    }

    #[tokio::test]
    async fn block_query_treats_bad_header_as_no_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/fleet/security"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Consul-Index", "not-a-number")
                    .set_body_json(json!([])),
            )
            .mount(&server)
            .await;

        let kv = KvClient::new(server.uri());
        assert_eq!(kv.block_query("security", 0, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_kv_reports_acknowledgement() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/fleet/nodes/h1"))
            .and(query_param("flags", "1700000000"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .mount(&server)
            .await;

        let kv = KvClient::new(server.uri());
        assert!(kv
            .put_kv("nodes/h1", 1_700_000_000, &json!({"resource": {}}))
            .await
            .unwrap());
    }
}
