//! REST API regression tests.
//!
//! Drives the full router against an in-memory store: application records,
//! deployment creation, batch node actions and whole-deployment operations.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use grayline_health::{Evaluator, HealthMonitor, PrometheusClient};
use grayline_rollout::{
    BoxFuture, Coordinator, ExecutionError, ExecutionOutcome, ExecutionPool, ExecutionRequest,
    Executor, MockExecutor,
};
use grayline_state::*;
use serde_json::{Value, json};
use tower::ServiceExt;

/// Never finishes, so dispatched nodes stay `deploying`.
struct Parked;

impl Executor for Parked {
    fn execute(
        &self,
        _req: ExecutionRequest,
    ) -> BoxFuture<'_, Result<ExecutionOutcome, ExecutionError>> {
        Box::pin(std::future::pending())
    }
}

fn router_with(executor: Arc<dyn Executor>) -> Router {
    let store = StateStore::open_in_memory().unwrap();
    let pool = ExecutionPool::new(executor, 4, Duration::from_secs(3600));
    let coordinator = Coordinator::new(store.clone(), pool);
    let evaluator = Evaluator::new(
        Arc::new(PrometheusClient::new("127.0.0.1:1")),
        Duration::from_millis(200),
        Duration::from_secs(300),
        Duration::from_secs(60),
    );
    let monitor = HealthMonitor::new(store, evaluator, Duration::from_secs(30));
    grayline_api::build_router(coordinator, monitor)
}

fn application() -> Value {
    json!({
        "name": "billing",
        "nodes": [
            { "id": "a", "address": "10.0.0.1" },
            { "id": "b", "address": "10.0.0.2" },
            { "id": "c", "address": "10.0.0.3" }
        ]
    })
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            req = req.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&value).unwrap())
        }
        None => Body::empty(),
    };
    let resp = router.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn setup(router: &Router) -> String {
    let (status, _) = send(router, "PUT", "/api/v1/applications/billing", Some(application())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        router,
        "POST",
        "/api/v1/deployments",
        Some(json!({ "app": "billing", "version": "2.4.0" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "pending");
    body["data"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn healthz_responds() {
    let router = router_with(Arc::new(MockExecutor));
    let (status, _) = send(&router, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn application_round_trip_reports_invalid_rules() {
    let router = router_with(Arc::new(MockExecutor));
    let mut app = application();
    app["rollback_policy"] = json!({
        "enabled": true,
        "auto_rollback": true,
        "notify_channel": "ops",
        "alert_rules": [
            { "name": "restarts", "expr": "increase(restarts[5m]) > 3", "duration": "5m", "severity": "critical" },
            { "name": "broken", "expr": "up == 0", "duration": "soon", "severity": "warning" }
        ]
    });

    let (status, body) = send(&router, "PUT", "/api/v1/applications/billing", Some(app)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["policy_errors"][0]["rule"], "broken");

    let (status, body) = send(&router, "GET", "/api/v1/applications/billing", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["application"]["nodes"].as_array().unwrap().len(), 3);

    let (status, _) = send(&router, "GET", "/api/v1/applications/ledger", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn application_name_must_match_path() {
    let router = router_with(Arc::new(MockExecutor));
    let (status, body) = send(&router, "PUT", "/api/v1/applications/ledger", Some(application())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn create_for_unknown_application_is_not_found() {
    let router = router_with(Arc::new(MockExecutor));
    let (status, body) = send(
        &router,
        "POST",
        "/api/v1/deployments",
        Some(json!({ "app": "ghost", "version": "1.0.0" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn create_with_gray_node_starts_deploying() {
    let router = router_with(Arc::new(Parked));
    send(&router, "PUT", "/api/v1/applications/billing", Some(application())).await;

    let (status, body) = send(
        &router,
        "POST",
        "/api/v1/deployments",
        Some(json!({ "app": "billing", "version": "2.4.0", "gray_node": "b" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "deploying");

    let (status, _) = send(
        &router,
        "POST",
        "/api/v1/deployments",
        Some(json!({ "app": "billing", "version": "2.4.0", "gray_node": "z" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn batch_results_are_reported_per_node() {
    let router = router_with(Arc::new(Parked));
    let id = setup(&router).await;

    let (status, body) = send(
        &router,
        "POST",
        &format!("/api/v1/deployments/{id}/nodes/deploy"),
        Some(json!({ "node_ids": ["a", "b", "zz"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["data"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["node_id"], "a");
    assert_eq!(results[0]["result"], "applied");
    assert_eq!(results[0]["to"], "deploying");
    assert_eq!(results[1]["result"], "rejected");
    assert_eq!(results[1]["error"], "validation");
    assert_eq!(results[2]["error"], "not_found");

    let (_, body) = send(
        &router,
        "POST",
        &format!("/api/v1/deployments/{id}/nodes/deploy"),
        Some(json!({ "node_ids": ["a"] })),
    )
    .await;
    assert_eq!(body["data"][0]["error"], "conflict");

    let (_, body) = send(&router, "GET", &format!("/api/v1/deployments/{id}"), None).await;
    assert_eq!(body["data"]["status"], "deploying");
}

#[tokio::test]
async fn node_action_validates_request() {
    let router = router_with(Arc::new(MockExecutor));
    let id = setup(&router).await;

    let (status, _) = send(
        &router,
        "POST",
        &format!("/api/v1/deployments/{id}/nodes/promote"),
        Some(json!({ "node_ids": ["a"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &router,
        "POST",
        &format!("/api/v1/deployments/{id}/nodes/skip"),
        Some(json!({ "node_ids": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &router,
        "POST",
        "/api/v1/deployments/missing/nodes/skip",
        Some(json!({ "node_ids": ["a"] })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn canceled_deployment_rejects_rollback() {
    let router = router_with(Arc::new(MockExecutor));
    let id = setup(&router).await;

    let (status, body) = send(&router, "POST", &format!("/api/v1/deployments/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "canceled");
    assert!(
        body["data"]["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .all(|n| n["status"] == "canceled")
    );

    let (status, _) = send(&router, "POST", &format!("/api/v1/deployments/{id}/rollback"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(
        &router,
        "POST",
        &format!("/api/v1/deployments/{id}/nodes/deploy"),
        Some(json!({ "node_ids": ["a"] })),
    )
    .await;
    assert_eq!(body["data"][0]["error"], "validation");
}

#[tokio::test]
async fn report_is_not_found_until_written() {
    let router = router_with(Arc::new(MockExecutor));
    let id = setup(&router).await;

    let (status, _) = send(&router, "GET", &format!("/api/v1/deployments/{id}/report"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_filters_by_status() {
    let router = router_with(Arc::new(MockExecutor));
    let first = setup(&router).await;
    let _second = setup(&router).await;
    send(&router, "POST", &format!("/api/v1/deployments/{first}/cancel"), None).await;

    let (status, body) = send(&router, "GET", "/api/v1/deployments?app=billing", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 2);

    let (_, body) = send(&router, "GET", "/api/v1/deployments?status=canceled", None).await;
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["items"][0]["id"], first.as_str());
}

#[tokio::test]
async fn out_of_range_page_is_empty() {
    let router = router_with(Arc::new(MockExecutor));
    setup(&router).await;

    let (status, body) = send(
        &router,
        "GET",
        &format!("/api/v1/deployments?page={}&page_size=20", usize::MAX),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 1);
    assert!(body["data"]["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn metrics_expose_deploying_nodes() {
    let router = router_with(Arc::new(Parked));
    send(&router, "PUT", "/api/v1/applications/billing", Some(application())).await;
    let (_, body) = send(
        &router,
        "POST",
        "/api/v1/deployments",
        Some(json!({ "app": "billing", "version": "2.4.0", "gray_node": "b" })),
    )
    .await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));

    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains(&format!(
        "grayline_node_deploying_info{{node=\"b\",host=\"10.0.0.2\",app=\"billing\",version=\"2.4.0\",deployment=\"{id}\"}} 1"
    )));
    assert!(text.contains("grayline_deployments{status=\"deploying\"} 1"));
}
