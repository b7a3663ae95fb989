//! Leader election via the scheduling lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use super::http::KvClient;
use super::session::SessionManager;

/// Key under the KV prefix holding the scheduling lock.
const LEADER_KEY: &str = "leader";

/// Acquires the scheduling lock with the current session.
///
/// Leadership is exactly the boolean result of one conditional write and
/// is re-evaluated every cycle — the store releases the lock whenever
/// the session expires, so a cached answer proves nothing.
pub struct LeaderElector {
    kv: Arc<KvClient>,
    sessions: Arc<SessionManager>,
    node_name: String,
    /// Last election outcome, for status reporting only.
    is_leader: AtomicBool,
}

impl LeaderElector {
    pub fn new(
        kv: Arc<KvClient>,
        sessions: Arc<SessionManager>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            kv,
            sessions,
            node_name: node_name.into(),
            is_leader: AtomicBool::new(false),
        }
    }

    /// Attempt to take the lock. Requires a live session; without one
    /// this node cannot lead this cycle.
    pub async fn elect(&self) -> bool {
        let session_id = self.sessions.current().await;
        if session_id.is_empty() {
            debug!("no session, skipping leader election");
            self.is_leader.store(false, Ordering::SeqCst);
            return false;
        }

        let body = json!(self.node_name);
        let leader = match self
            .kv
            .put_kv_acquire(LEADER_KEY, &session_id, Utc::now().timestamp(), &body)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(error = %e, "leader acquisition failed");
                false
            }
        };

        self.is_leader.store(leader, Ordering::SeqCst);
        debug!(leader, "leader election evaluated");
        leader
    }

    /// Last observed outcome; informational, never used for gating.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn elector(server: &MockServer, with_session: bool) -> LeaderElector {
        let kv = Arc::new(KvClient::new(server.uri()));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&kv), "h1", 30));
        if with_session {
            sessions.recover("sess-1").await;
        }
        LeaderElector::new(kv, sessions, "h1")
    }

    #[tokio::test]
    async fn no_session_means_no_leadership() {
        let server = MockServer::start().await;
        // No lock endpoint mocked: an unexpected request would fail the
        // test, proving election short-circuits before any store call.
        let elector = elector(&server, false).await;

        assert!(!elector.elect().await);
        assert!(!elector.is_leader());
    }

    #[tokio::test]
    async fn leadership_is_the_acquire_response() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/fleet/leader"))
            .and(query_param("acquire", "sess-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .mount(&server)
            .await;

        let elector = elector(&server, true).await;

        assert!(elector.elect().await);
        assert!(elector.is_leader());
    }

    #[tokio::test]
    async fn lost_acquisition_clears_the_flag() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/fleet/leader"))
            .respond_with(ResponseTemplate::new(200).set_body_string("false"))
            .mount(&server)
            .await;

        let elector = elector(&server, true).await;
        elector.is_leader.store(true, Ordering::SeqCst);

        assert!(!elector.elect().await);
        assert!(!elector.is_leader());
    }

    #[tokio::test]
    async fn transport_failure_is_not_leadership() {
        let kv = Arc::new(KvClient::new("http://127.0.0.1:1"));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&kv), "h1", 30));
        sessions.recover("sess-1").await;
        let elector = LeaderElector::new(kv, sessions, "h1");

        assert!(!elector.elect().await);
    }

    #[tokio::test]
    async fn hostname_is_written_to_the_lock() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/fleet/leader"))
            .and(wiremock::matchers::body_json(json!("h1")))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(1)
            .mount(&server)
            .await;

        let elector = elector(&server, true).await;
        assert!(elector.elect().await);
    }
}
