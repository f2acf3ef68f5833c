//! Control API tests

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use deckhand::deploy::fsm::AppStatus;
use deckhand::server::serve::router;
use deckhand::server::state::ServerState;

use crate::common::{project_archive, Harness};

fn server_state(h: &Harness) -> ServerState {
    ServerState::new(
        h.state.engine.clone(),
        h.state.backups.clone(),
        h.state.monitor.clone(),
    )
}

fn app_router(h: &Harness) -> Router {
    router(Arc::new(server_state(h)))
}

/// Hex of a sha256 chain; gzip cannot shrink it much below half
fn incompressible_text(len: usize) -> String {
    let mut text = String::with_capacity(len + 64);
    let mut digest = deckhand::utils::sha256_hash(b"seed");
    while text.len() < len {
        text.push_str(&digest);
        digest = deckhand::utils::sha256_hash(digest.as_bytes());
    }
    text
}

fn request(method: Method, uri: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap()
}

async fn send(router: &Router, req: Request<Body>) -> Response {
    tokio_test::assert_ok!(router.clone().oneshot(req).await)
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = Harness::new().await;
    let router = app_router(&h);

    let response = send(&router, request(Method::GET, "/health", Body::empty())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "deckhand");
}

#[tokio::test]
async fn test_app_crud_and_error_mapping() {
    let h = Harness::new().await;
    let router = app_router(&h);
    let spec = json!({ "name": "blog", "kind": "container" }).to_string();

    let response = send(&router, request(Method::POST, "/apps", Body::from(spec.clone()))).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let app = body_json(response).await;
    assert_eq!(app["name"], "blog");
    assert_eq!(app["status"], "pending");

    let response = send(&router, request(Method::POST, "/apps", Body::from(spec))).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["kind"], "conflict");

    let bad = json!({ "name": "Not A Name!", "kind": "container" }).to_string();
    let response = send(&router, request(Method::POST, "/apps", Body::from(bad))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["kind"], "validation");

    let response = send(&router, request(Method::GET, "/apps/missing", Body::empty())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "not-found");
    assert!(body["error"].as_str().unwrap().contains("missing"));

    let response = send(&router, request(Method::GET, "/apps", Body::empty())).await;
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

    let response = send(&router, request(Method::DELETE, "/apps/blog", Body::empty())).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = send(&router, request(Method::GET, "/apps/blog", Body::empty())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deploy_streams_log_and_final_status() {
    let h = Harness::new().await;
    h.create("blog").await;
    let router = app_router(&h);

    let response = send(
        &router,
        request(
            Method::POST,
            "/apps/blog/deploy?kind=image&image=ghost:5",
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let deployment_id = response
        .headers()
        .get("x-deployment-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let log = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(log.contains("Deploying blog"));
    assert!(log.ends_with(&format!("==> status: deployed {}\n", deployment_id)));
    assert_eq!(h.app("blog").status, AppStatus::Running);

    // The durable log matches what was streamed, minus the status line
    let uri = format!("/deployments/{}/log", deployment_id);
    let response = send(&router, request(Method::GET, &uri, Body::empty())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let durable = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(durable.contains("Deploying blog"));
    assert!(!durable.contains("==> status:"));

    let response = send(&router, request(Method::GET, "/apps/blog/deployments", Body::empty())).await;
    let deployments = body_json(response).await;
    assert_eq!(deployments[0]["id"], deployment_id.as_str());
    assert_eq!(deployments[0]["active"], true);
}

#[tokio::test]
async fn test_deploy_acceptance_errors_are_plain_responses() {
    let h = Harness::new().await;
    h.create("blog").await;
    let router = app_router(&h);

    let response = send(&router, request(Method::POST, "/apps/blog/deploy?kind=image", Body::empty())).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let _guard = h.state.engine.locks().try_lock_app("blog").unwrap();
    let response = send(
        &router,
        request(
            Method::POST,
            "/apps/blog/deploy?kind=image&image=ghost:5",
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_client_disconnect_cancels_build() {
    let h = Harness::new().await;
    h.create("api").await;
    h.runtime.set_build_delay(Duration::from_secs(30));
    let router = app_router(&h);

    let archive = project_archive(&[("Dockerfile", "FROM alpine\n")]);
    let response = send(
        &router,
        request(Method::POST, "/apps/api/deploy?kind=upload", Body::from(archive)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    drop(response);

    let mut status = h.app("api").status;
    for _ in 0..100 {
        if status == AppStatus::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = h.app("api").status;
    }
    assert_eq!(status, AppStatus::Failed);

    let deployments = h.state.engine.list_deployments("api").unwrap();
    assert!(deployments[0].error.as_deref().unwrap().contains("ancel"));
}

#[tokio::test]
async fn test_deploy_accepts_large_upload() {
    let h = Harness::new().await;
    h.create("api").await;
    let router = app_router(&h);

    let payload = incompressible_text(8 * 1024 * 1024);
    let archive = project_archive(&[("Dockerfile", "FROM alpine\n"), ("assets/blob.txt", &payload)]);
    assert!(archive.len() > 3 * 1024 * 1024);

    let response = send(
        &router,
        request(Method::POST, "/apps/api/deploy?kind=upload", Body::from(archive)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let log = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(log.contains("==> status: deployed"), "{}", log);
    assert_eq!(h.app("api").status, AppStatus::Running);
}

#[tokio::test]
async fn test_deploy_rejects_upload_over_limit() {
    let h = Harness::new().await;
    h.create("api").await;
    let router = router(Arc::new(server_state(&h).with_max_upload_bytes(1024)));

    let response = send(
        &router,
        request(
            Method::POST,
            "/apps/api/deploy?kind=upload",
            Body::from(vec![0u8; 4096]),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(h.app("api").status, AppStatus::Pending);
}

#[tokio::test]
async fn test_app_health_endpoints() {
    let h = Harness::new().await;
    h.create("blog").await;
    h.deploy_image("blog", "ghost:5").await.unwrap();
    let router = app_router(&h);

    let response = send(&router, request(Method::POST, "/apps/blog/health/check", Body::empty())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["check"], "healthy");

    let response = send(&router, request(Method::GET, "/apps/blog/health", Body::empty())).await;
    assert_eq!(body_json(response).await["status"], "running");
}

#[tokio::test]
async fn test_backup_endpoints() {
    let h = Harness::new().await;
    h.create("blog").await;
    let router = app_router(&h);

    let response = send(&router, request(Method::POST, "/backups", Body::empty())).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let backup = body_json(response).await;
    let id = backup["id"].as_str().unwrap().to_string();

    let response = send(&router, request(Method::GET, "/backups", Body::empty())).await;
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

    let uri = format!("/backups/{}/restore?database=true", id);
    let response = send(&router, request(Method::POST, &uri, Body::empty())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["database_restored"], true);

    let uri = format!("/backups/{}", id);
    let response = send(&router, request(Method::DELETE, &uri, Body::empty())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], id.as_str());
    assert!(body["warnings"].as_array().unwrap().is_empty());

    let response = send(&router, request(Method::DELETE, &uri, Body::empty())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_prune_endpoint() {
    let h = Harness::new().await;
    h.create("blog").await;
    h.deploy_image("blog", "ghost:1").await.unwrap();
    h.deploy_image("blog", "ghost:2").await.unwrap();
    let router = app_router(&h);

    let response = send(&router, request(Method::POST, "/images/prune?keep=0", Body::empty())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let removed = body_json(response).await["removed"].clone();
    assert_eq!(removed, json!(["ghost:1"]));
}
