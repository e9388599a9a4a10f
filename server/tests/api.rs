//! HTTP surface over the in-memory collaborators.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
use user_service::api::extractors::{CORRELATION_ID_HEADER, USER_ID_HEADER};
use user_service::api::health::Readiness;
use user_service::api::{self, ApiState};
use user_service::{ServiceSettings, UserService};
use user_service_core::store::StoreError;
use user_service_core::{User, UserId};
use user_service_testing::{InMemoryProjectionCache, InMemoryUserStore, StoreOp};

struct Fixture {
    router: Router,
    store: Arc<InMemoryUserStore>,
    readiness: Readiness,
}

fn fixture() -> Fixture {
    let store = Arc::new(InMemoryUserStore::new());
    let cache = Arc::new(InMemoryProjectionCache::new());
    let (service, _worker) = UserService::new(Arc::clone(&store), cache, ServiceSettings::default());
    let readiness = Readiness::new();
    let router = api::router(ApiState {
        service,
        readiness: readiness.clone(),
    });
    Fixture {
        router,
        store,
        readiness,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str, caller: Option<UserId>) -> Request<Body> {
    let mut request = Request::get(uri);
    if let Some(caller) = caller {
        request = request.header(USER_ID_HEADER, caller.to_string());
    }
    request.body(Body::empty()).unwrap()
}

fn json_request(method: &str, uri: &str, caller: Option<UserId>, body: &Value) -> Request<Body> {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(caller) = caller {
        request = request.header(USER_ID_HEADER, caller.to_string());
    }
    request.body(Body::from(body.to_string())).unwrap()
}

fn seed(store: &InMemoryUserStore, name: &str) -> User {
    let user = User::registered(name);
    store.seed(user.clone());
    user
}

#[tokio::test]
async fn owner_reads_own_record() {
    let f = fixture();
    let alice = seed(&f.store, "alice");

    let (status, body) = send(&f.router, get(&format!("/v1/users/{}", alice.id), Some(alice.id))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "alice");
    assert_eq!(body["id"], alice.id.to_string());
    assert!(body["created_at"].is_string());
}

#[tokio::test]
async fn reading_someone_else_is_forbidden() {
    let f = fixture();
    let alice = seed(&f.store, "alice");

    let (status, body) = send(
        &f.router,
        get(&format!("/v1/users/{}", alice.id), Some(UserId::new())),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "PERMISSION_DENIED");
    assert_eq!(f.store.total_calls(), 0);
}

#[tokio::test]
async fn malformed_ids_are_bad_requests() {
    let f = fixture();

    let (status, body) = send(&f.router, get("/v1/users/not-a-uuid", Some(UserId::new()))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_ARGUMENT");

    let request = Request::get("/v1/users/short?id=42")
        .header(USER_ID_HEADER, "also-bad")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&f.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn update_changes_display_fields() {
    let f = fixture();
    let alice = seed(&f.store, "alice");
    let body = json!({
        "display_name": "Alice A.",
        "image_url": "https://img.example.com/alice.png",
        "status_text": "hiking"
    });

    let (status, response) = send(
        &f.router,
        json_request("PUT", &format!("/v1/users/{}", alice.id), Some(alice.id), &body),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["display_name"], "Alice A.");
    assert_eq!(f.store.user(alice.id).unwrap().status_text.as_deref(), Some("hiking"));
}

#[tokio::test]
async fn invalid_update_is_rejected() {
    let f = fixture();
    let alice = seed(&f.store, "alice");
    let body = json!({ "display_name": "Alice", "image_url": "ftp://nope" });

    let (status, response) = send(
        &f.router,
        json_request("PUT", &format!("/v1/users/{}", alice.id), Some(alice.id), &body),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["code"], "INVALID_ARGUMENT");
    assert_eq!(f.store.calls(StoreOp::Update), 0);
}

#[tokio::test]
async fn short_projection_by_id_and_username() {
    let f = fixture();
    let alice = seed(&f.store, "alice");

    let (status, by_id) = send(&f.router, get(&format!("/v1/users/short?id={}", alice.id), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(by_id["username"], "alice");

    let (status, by_name) = send(&f.router, get("/v1/users/short?username=alice", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(by_name["id"], alice.id.to_string());

    let (status, _) = send(&f.router, get("/v1/users/short", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_user_is_not_found() {
    let f = fixture();

    let (status, body) = send(&f.router, get("/v1/users/short?username=ghost", None)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn batch_returns_existing_users() {
    let f = fixture();
    let alice = seed(&f.store, "alice");
    let bob = seed(&f.store, "bob");
    let body = json!({ "ids": [alice.id.to_string(), bob.id.to_string(), UserId::new().to_string()] });

    let (status, response) = send(&f.router, json_request("POST", "/v1/users/short/batch", None, &body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["users"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn empty_batch_is_a_bad_request() {
    let f = fixture();

    let (status, _) = send(
        &f.router,
        json_request("POST", "/v1/users/short/batch", None, &json!({ "ids": [] })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(f.store.total_calls(), 0);
}

#[tokio::test]
async fn internal_errors_hide_their_cause() {
    let f = fixture();
    f.store.fail_always(
        StoreOp::GetProjectionByUsername,
        StoreError::Internal("password authentication failed".into()),
    );

    let (status, body) = send(&f.router, get("/v1/users/short?username=alice", None)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "INTERNAL");
    assert!(!body["message"].as_str().unwrap().contains("password"));
}

#[tokio::test]
async fn correlation_id_header_is_accepted() {
    let f = fixture();
    let alice = seed(&f.store, "alice");
    let request = Request::get("/v1/users/short?username=alice")
        .header(CORRELATION_ID_HEADER, uuid::Uuid::new_v4().to_string())
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&f.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], alice.id.to_string());
}

#[tokio::test]
async fn probes_report_liveness_and_readiness() {
    let f = fixture();

    let (status, _) = send(&f.router, get("/liveness", None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&f.router, get("/readiness", None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    f.readiness.set(true);
    let (status, _) = send(&f.router, get("/readiness", None)).await;
    assert_eq!(status, StatusCode::OK);
}
