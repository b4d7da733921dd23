mod common;

use std::sync::Arc;
use std::time::Duration;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use colabri_board::auth::OrgScopedAccess;
use colabri_board::config::Config;
use colabri_board::db::{MemoryStore, StoreProvider};
use colabri_board::ws::RoomRegistry;
use colabri_board::{build_app, AppState};
use common::{admin_token, services_with, token};
use serde_json::Value;
use tower::ServiceExt;

fn app() -> Router {
    let stores: Arc<dyn StoreProvider> = Arc::new(MemoryStore::new());
    let services = services_with(stores, Arc::new(OrgScopedAccess), Duration::from_secs(60));
    let state = AppState::new(Config::default(), RoomRegistry::new(services));
    build_app(Arc::new(state))
}

async fn get(app: Router, uri: &str, bearer: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().uri(uri);
    if let Some(bearer) = bearer {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", bearer));
    }
    let response = app.oneshot(request.body(Body::empty()).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn health_and_ready() {
    let (status, body) = get(app(), "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body.get("rooms").is_none());

    let (status, body) = get(app(), "/api/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rooms"], 0);
}

#[tokio::test]
async fn socket_without_token_is_unauthorized() {
    let (status, body) = get(app(), "/api/v1/rooms/r1/ws", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);
}

#[tokio::test]
async fn socket_with_expired_token_says_so() {
    let uri = format!("/api/v1/rooms/r1/ws?token={}", token("alice", None, -300));
    let (status, body) = get(app(), &uri, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "auth_expired");
    assert_eq!(body["shouldRetry"], true);
}

#[tokio::test]
async fn refused_tokens_name_the_failure_in_the_challenge() {
    let expired = format!("/api/v1/rooms/r1/ws?token={}", token("alice", None, -300));
    let response = app()
        .oneshot(Request::builder().uri(expired).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap().to_string();
    assert!(challenge.contains(r#"error_description="auth_expired""#), "{}", challenge);

    let (status, body) = get(app(), "/api/v1/rooms/r1/ws?token=not-a-jwt", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "auth_malformed");
    assert_eq!(body["shouldRetry"], false);
}

#[tokio::test]
async fn socket_for_foreign_org_is_forbidden() {
    let uri = format!("/api/v1/rooms/acme%2Fplan/ws?token={}", token("eve", Some("globex"), 600));
    let (status, _) = get(app(), &uri, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn plain_get_on_socket_route_needs_upgrade() {
    let uri = format!("/api/v1/rooms/acme%2Fplan/ws?token={}", token("ann", Some("acme"), 600));
    let (status, _) = get(app(), &uri, None).await;
    assert_eq!(status, StatusCode::UPGRADE_REQUIRED);

    // The bearer header works as well as the query parameter.
    let bearer = token("ann", Some("acme"), 600);
    let (status, _) = get(app(), "/api/v1/rooms/acme%2Fplan/ws", Some(&bearer)).await;
    assert_eq!(status, StatusCode::UPGRADE_REQUIRED);
}

#[tokio::test]
async fn diagnostics_are_for_cloud_admins() {
    let (status, _) = get(app(), "/api/v1/diagnostics", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let user = token("alice", Some("acme"), 600);
    let (status, _) = get(app(), "/api/v1/diagnostics", Some(&user)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = admin_token("root");
    let (status, body) = get(app(), "/api/v1/diagnostics", Some(&admin)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["n_rooms"], 0);
    assert_eq!(body["n_sessions"], 0);
}
