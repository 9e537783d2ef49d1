//! API integration tests.
//!
//! These tests drive the complete HTTP flow with axum's test utilities on
//! top of the in-memory session store and the loopback transport.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use base64::Engine;
use serde_json::{json, Value};
use tower::ServiceExt;

use pairgate::api::{create_router, AppState};
use pairgate::manager::{ManagerConfig, SessionManager};
use pairgate::pairing::PairingConfig;
use pairgate::security::ApiAuth;
use pairgate::store::MemorySessionRepository;
use pairgate::transport::loopback::LoopbackProvider;

const TOKEN: &str = "test-token";

struct TestApp {
    router: Router,
    provider: LoopbackProvider,
    manager: Arc<SessionManager>,
}

fn test_app() -> TestApp {
    let provider = LoopbackProvider::new();
    let config = ManagerConfig {
        pairing: PairingConfig {
            wait_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(20),
            default_code_ttl: Duration::from_secs(60),
        },
        ..ManagerConfig::default()
    };
    let manager = Arc::new(
        SessionManager::new(
            Arc::new(MemorySessionRepository::new()),
            Arc::new(provider.clone()),
            config,
        )
        .unwrap(),
    );
    let router = create_router(AppState::new(Arc::clone(&manager)), ApiAuth::token(TOKEN));
    TestApp {
        router,
        provider,
        manager,
    }
}

/// Helper to create an authenticated JSON request for `tenant`.
fn json_request(method: Method, uri: &str, tenant: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("apitoken", TOKEN)
        .header("SESSIONKEY", tenant);

    match body {
        Some(json) => builder.body(Body::from(json.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Helper to extract JSON from response.
async fn response_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap_or(Value::Null)
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    (status, response_json(response).await)
}

async fn register(app: &TestApp, tenant: &str, key: &str, email: &str) -> (StatusCode, Value) {
    send(
        app,
        json_request(
            Method::POST,
            "/api/v1/sessions",
            tenant,
            Some(json!({ "session_key": key, "name": "Owner", "email": email })),
        ),
    )
    .await
}

/// Register `key` and scan its code as `account`.
async fn register_and_pair(app: &TestApp, tenant: &str, key: &str, account: &str) {
    let (status, _) = register(app, tenant, key, &format!("{key}@example.com")).await;
    assert_eq!(status, StatusCode::CREATED);
    app.provider.last_client().unwrap().complete_pairing(account);
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ============================================================================
// Health & Auth Tests
// ============================================================================

#[tokio::test]
async fn test_health_needs_no_token() {
    let app = test_app();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

    let (status, json) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["live_connections"], 0);
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let app = test_app();
    let request = Request::builder()
        .uri("/api/v1/sessions")
        .header("SESSIONKEY", "acme")
        .body(Body::empty())
        .unwrap();

    let (status, json) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_wrong_token_is_unauthorized() {
    let app = test_app();
    let request = Request::builder()
        .uri("/api/v1/sessions")
        .header("apitoken", "nope")
        .header("SESSIONKEY", "acme")
        .body(Body::empty())
        .unwrap();

    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_missing_tenant_header_is_bad_request() {
    let app = test_app();
    let request = Request::builder()
        .uri("/api/v1/sessions")
        .header("apitoken", TOKEN)
        .body(Body::empty())
        .unwrap();

    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// Registration & Pairing Tests
// ============================================================================

#[tokio::test]
async fn test_register_returns_png_code() {
    let app = test_app();

    let (status, json) = register(&app, "acme", "alice", "alice@example.com").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["session_key"], "alice");
    assert_eq!(json["status"], "pending");
    assert!(json["expires_at"].is_string());

    let png = base64::engine::general_purpose::STANDARD
        .decode(json["qr_code_base64"].as_str().unwrap())
        .unwrap();
    assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
}

#[tokio::test]
async fn test_register_validates_body() {
    let app = test_app();
    let (status, json) = register(&app, "acme", "alice", "not-an-email").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_register_email_conflict() {
    let app = test_app();
    register(&app, "acme", "alice", "shared@example.com").await;

    let (status, json) = register(&app, "acme", "bob", "shared@example.com").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "CONFLICT");
}

#[tokio::test]
async fn test_qr_then_already_connected() {
    let app = test_app();
    let (_, registered) = register(&app, "acme", "alice", "alice@example.com").await;

    let (status, json) = send(&app, json_request(Method::GET, "/api/v1/sessions/alice/qr", "acme", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "pending");
    assert_eq!(json["qr_code_base64"], registered["qr_code_base64"]);

    app.provider.last_client().unwrap().complete_pairing("5511999990000");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, json) = send(&app, json_request(Method::GET, "/api/v1/sessions/alice/qr", "acme", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "connected");
    assert!(json.get("qr_code_base64").is_none());

    let (_, session) = send(&app, json_request(Method::GET, "/api/v1/sessions/alice", "acme", None)).await;
    assert_eq!(session["status"], "connected");
    assert_eq!(session["account_id"], "5511999990000");
    assert_eq!(session["live"], true);
}

#[tokio::test]
async fn test_reregister_keeps_one_connection() {
    let app = test_app();
    register(&app, "acme", "alice", "alice@example.com").await;
    let first = app.provider.last_client().unwrap();

    let (status, _) = register(&app, "acme", "alice", "alice@example.com").await;
    assert_eq!(status, StatusCode::CREATED);

    assert_eq!(first.disconnect_count(), 1);
    assert_eq!(app.manager.registry().len().unwrap(), 1);
}

// ============================================================================
// Session Management Tests
// ============================================================================

#[tokio::test]
async fn test_tenants_are_isolated() {
    let app = test_app();
    register(&app, "acme", "alice", "alice@example.com").await;

    let (status, json) = send(&app, json_request(Method::GET, "/api/v1/sessions/alice", "globex", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "SESSION_NOT_FOUND");

    let (_, list) = send(&app, json_request(Method::GET, "/api/v1/sessions", "globex", None)).await;
    assert_eq!(list["count"], 0);

    let (_, list) = send(&app, json_request(Method::GET, "/api/v1/sessions", "acme", None)).await;
    assert_eq!(list["count"], 1);
    assert!(list["sessions"][0].get("pairing_code").is_none());
}

#[tokio::test]
async fn test_delete_missing_session() {
    let app = test_app();
    let (status, _) = send(&app, json_request(Method::DELETE, "/api/v1/sessions/bob", "acme", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_disconnect_then_delete() {
    let app = test_app();
    register_and_pair(&app, "acme", "alice", "5511888880000").await;

    let (status, json) = send(&app, json_request(Method::POST, "/api/v1/sessions/alice/disconnect", "acme", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["disconnected"], true);

    let (_, json) = send(&app, json_request(Method::POST, "/api/v1/sessions/alice/disconnect", "acme", None)).await;
    assert_eq!(json["disconnected"], false);

    let (_, session) = send(&app, json_request(Method::GET, "/api/v1/sessions/alice", "acme", None)).await;
    assert_eq!(session["status"], "disconnected");
    assert_eq!(session["live"], false);

    let (status, _) = send(&app, json_request(Method::DELETE, "/api/v1/sessions/alice", "acme", None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, list) = send(&app, json_request(Method::GET, "/api/v1/sessions", "acme", None)).await;
    assert_eq!(list["count"], 0);
}

// ============================================================================
// Messaging Tests
// ============================================================================

#[tokio::test]
async fn test_send_text_on_connected_session() {
    let app = test_app();
    register_and_pair(&app, "acme", "alice", "5511777770000").await;

    let (status, json) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/sessions/alice/messages/text",
            "acme",
            Some(json!({ "number": "(11) 91234-5678", "text": "hello" })),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["recipient"], "5511912345678@s.whatsapp.net");
    assert!(json["message_id"].as_str().unwrap().starts_with("LB"));
    assert_eq!(app.provider.last_client().unwrap().sent_messages().len(), 1);
}

#[tokio::test]
async fn test_send_text_on_pending_session() {
    let app = test_app();
    register(&app, "acme", "alice", "alice@example.com").await;

    let (status, json) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/sessions/alice/messages/text",
            "acme",
            Some(json!({ "number": "11912345678", "text": "hello" })),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "NOT_CONNECTED");
}

#[tokio::test]
async fn test_send_base64_media() {
    let app = test_app();
    register_and_pair(&app, "acme", "alice", "5511666660000").await;

    let (status, _) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/sessions/alice/messages/media",
            "acme",
            Some(json!({
                "number": "11912345678",
                "caption": "report",
                "media_base64": "data:application/pdf;base64,JVBERi0xLjQK",
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_send_media_without_source() {
    let app = test_app();
    register_and_pair(&app, "acme", "alice", "5511555550000").await;

    let (status, json) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/sessions/alice/messages/media",
            "acme",
            Some(json!({ "number": "11912345678" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
}
