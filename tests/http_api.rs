//! HTTP remote tests against a wiremock server.
//!
//! Covers the request shape (bearer auth, scope query), the status code
//! mapping, and the session restore loop after a 401.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use resource_sync::{
    HttpResourceApi, RemoteConfig, ResourceApi, ResourceDraft, ResourceId, ResourceStatus,
    ScopeId, SessionProvider, StaticSession, SyncError,
};

// =============================================================================
// Helpers
// =============================================================================

fn remote(server: &MockServer) -> RemoteConfig {
    RemoteConfig {
        base_url: server.uri(),
        request_timeout_ms: 2_000,
        session_retries: 2,
        session_retry_delay_ms: 1,
    }
}

fn api(server: &MockServer, session: Arc<dyn SessionProvider>) -> HttpResourceApi {
    HttpResourceApi::new(&remote(server), session).unwrap()
}

fn scope() -> ScopeId {
    ScopeId::new("org-1")
}

/// Hands out `fresh` once restored; counts restores.
struct RotatingSession {
    token: RwLock<Option<String>>,
    restores: AtomicUsize,
}

impl RotatingSession {
    fn new(token: &str) -> Self {
        Self {
            token: RwLock::new(Some(token.to_string())),
            restores: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionProvider for RotatingSession {
    fn access_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    async fn restore(&self) -> Result<(), SyncError> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        *self.token.write() = Some("fresh".to_string());
        Ok(())
    }

    fn clear(&self) {
        self.token.write().take();
    }
}

// =============================================================================
// Happy Path
// =============================================================================

#[tokio::test]
async fn list_sends_bearer_token_and_scope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resources"))
        .and(query_param("scope", "org-1"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "status": "connected", "fields": {"name": "a.csv"}},
            {"id": "0002", "status": "pending", "lastSyncedAt": "2025-03-01T12:00:00Z"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let items = api(&server, Arc::new(StaticSession::new("secret")))
        .list(&scope())
        .await
        .unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].id, ResourceId::new("1"));
    assert_eq!(items[0].status, ResourceStatus::Ready);
    assert_eq!(items[1].id, ResourceId::new("2"));
    assert!(items[1].is_processing());
    assert!(items[1].last_synced_at.is_some());
}

#[tokio::test]
async fn anonymous_session_sends_no_authorization() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resources"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let items = api(&server, Arc::new(StaticSession::anonymous()))
        .list(&scope())
        .await
        .unwrap();
    assert!(items.is_empty());
}

#[tokio::test]
async fn create_update_delete_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/resources"))
        .and(query_param("scope", "org-1"))
        .and(body_json(json!({"fields": {"name": "sales.csv"}})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 41, "status": "processing", "fields": {"name": "sales.csv"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/resources/41"))
        .and(body_json(json!({"status": "ready", "fields": {}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 41, "status": "ready", "fields": {"name": "sales.csv"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/resources/41"))
        .and(query_param("scope", "org-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let api = api(&server, Arc::new(StaticSession::new("t")));
    let created = api
        .create(&scope(), &ResourceDraft::default().with_field("name", json!("sales.csv")))
        .await
        .unwrap();
    assert_eq!(created.id, ResourceId::new("41"));
    assert_eq!(created.status, ResourceStatus::Processing);

    let updated = api
        .update(
            &scope(),
            &created.id,
            &ResourceDraft::default().with_status(ResourceStatus::Ready),
        )
        .await
        .unwrap();
    assert_eq!(updated.status, ResourceStatus::Ready);

    api.delete(&scope(), &created.id).await.unwrap();
}

// =============================================================================
// Status Mapping
// =============================================================================

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .mount(&server)
        .await;

    let err = api(&server, Arc::new(StaticSession::new("t")))
        .list(&scope())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SyncError::RateLimited {
            retry_after: Some(Duration::from_secs(7))
        }
    );
    assert!(err.is_retryable());
}

#[tokio::test]
async fn server_and_client_errors_are_mapped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("name is required"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such resource"))
        .mount(&server)
        .await;

    let api = api(&server, Arc::new(StaticSession::new("t")));

    let err = api.list(&scope()).await.unwrap_err();
    assert_eq!(
        err,
        SyncError::Server {
            status: 503,
            message: "maintenance".into()
        }
    );
    assert!(err.is_retryable());

    let err = api.create(&scope(), &ResourceDraft::default()).await.unwrap_err();
    assert_eq!(
        err,
        SyncError::Validation {
            status: 422,
            message: "name is required".into()
        }
    );
    assert!(!err.is_retryable());

    let err = api.delete(&scope(), &ResourceId::new("9")).await.unwrap_err();
    assert_eq!(err, SyncError::NotFound("no such resource".into()));
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let err = api(&server, Arc::new(StaticSession::new("t")))
        .list(&scope())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Decode(_)), "got {err:?}");
}

#[tokio::test]
async fn unreachable_host_is_a_network_error() {
    let config = RemoteConfig {
        base_url: "http://127.0.0.1:1".into(),
        request_timeout_ms: 500,
        ..Default::default()
    };
    let api = HttpResourceApi::new(&config, Arc::new(StaticSession::new("t"))).unwrap();

    let err = api.list(&scope()).await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)), "got {err:?}");
}

// =============================================================================
// Session Restore
// =============================================================================

#[tokio::test]
async fn unauthorized_restores_session_and_resends() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 5}])))
        .expect(1)
        .mount(&server)
        .await;

    let session = Arc::new(RotatingSession::new("stale"));
    let items = api(&server, session.clone()).list(&scope()).await.unwrap();

    assert_eq!(items.len(), 1);
    assert_eq!(session.restores.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_restore_clears_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        // First try plus two restore attempts
        .expect(3)
        .mount(&server)
        .await;

    let session = Arc::new(StaticSession::new("revoked"));
    let err = api(&server, session.clone()).list(&scope()).await.unwrap_err();

    assert_eq!(err, SyncError::AuthRequired);
    assert!(session.access_token().is_none());
}

#[tokio::test]
async fn non_auth_error_after_restore_is_returned_as_is() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&server)
        .await;

    let session = Arc::new(RotatingSession::new("stale"));
    let err = api(&server, session.clone()).list(&scope()).await.unwrap_err();

    assert!(matches!(err, SyncError::Server { status: 500, .. }));
    assert_eq!(session.restores.load(Ordering::SeqCst), 1);
    assert_eq!(session.access_token().as_deref(), Some("fresh"));
}
