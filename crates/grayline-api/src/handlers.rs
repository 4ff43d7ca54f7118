//! REST API handlers.
//!
//! Handlers translate HTTP into coordinator calls and map
//! [`RolloutError`] kinds onto status codes.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use grayline_policy::{PolicyError, validate};
use grayline_rollout::{ErrorKind, NodeAction, RolloutError};
use grayline_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::Policy => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::External => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rollout_error(e: RolloutError) -> axum::response::Response {
    error_response(&e.to_string(), status_for(e.kind())).into_response()
}

// ── Deployments ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub app: String,
    pub version: String,
    #[serde(default)]
    pub gray_node: Option<NodeId>,
}

/// GET /api/v1/deployments
pub async fn list_deployments(
    State(state): State<ApiState>,
    Query(filter): Query<DeploymentFilter>,
) -> impl IntoResponse {
    match state.coordinator.list(&filter) {
        Ok(page) => ApiResponse::ok(page).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// POST /api/v1/deployments
pub async fn create_deployment(
    State(state): State<ApiState>,
    Json(req): Json<CreateDeploymentRequest>,
) -> impl IntoResponse {
    match state
        .coordinator
        .create(&req.app, &req.version, req.gray_node.as_deref())
        .await
    {
        Ok(record) => (StatusCode::CREATED, ApiResponse::ok(record)).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// GET /api/v1/deployments/{id}
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.get(&id).await {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// POST /api/v1/deployments/{id}/cancel
pub async fn cancel_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.cancel(&id).await {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// POST /api/v1/deployments/{id}/rollback
pub async fn rollback_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.rollback(&id).await {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => rollout_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct NodeActionRequest {
    pub node_ids: Vec<NodeId>,
}

/// POST /api/v1/deployments/{id}/nodes/{action}
///
/// Per-node outcomes are returned in input order; a rejected node does not
/// fail the request.
pub async fn node_action(
    State(state): State<ApiState>,
    Path((id, action)): Path<(String, String)>,
    Json(req): Json<NodeActionRequest>,
) -> impl IntoResponse {
    let action: NodeAction = match action.parse() {
        Ok(action) => action,
        Err(msg) => return error_response(&msg, StatusCode::BAD_REQUEST).into_response(),
    };
    if req.node_ids.is_empty() {
        return error_response("node_ids must not be empty", StatusCode::BAD_REQUEST).into_response();
    }

    match state.coordinator.apply(&id, action, &req.node_ids).await {
        Ok(results) => ApiResponse::ok(results).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// GET /api/v1/deployments/{id}/report
pub async fn get_report(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.report(&id).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => rollout_error(e),
    }
}

// ── Applications ───────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ApplicationResponse {
    pub application: Application,
    /// Rules that failed validation and stay inactive.
    pub policy_errors: Vec<PolicyError>,
}

fn policy_errors(app: &Application) -> Vec<PolicyError> {
    app.rollback_policy.as_ref().map(validate).unwrap_or_default()
}

/// GET /api/v1/applications
pub async fn list_applications(State(state): State<ApiState>) -> impl IntoResponse {
    match state.coordinator.store().list_applications() {
        Ok(apps) => ApiResponse::ok(apps).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/applications/{name}
pub async fn get_application(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.store().get_application(&name) {
        Ok(Some(application)) => ApiResponse::ok(ApplicationResponse {
            policy_errors: policy_errors(&application),
            application,
        })
        .into_response(),
        Ok(None) => error_response("application not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// PUT /api/v1/applications/{name}
///
/// Stores the record even when some alert rules are invalid; those rules
/// are listed in `policy_errors` and stay inactive.
pub async fn put_application(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(mut application): Json<Application>,
) -> impl IntoResponse {
    if application.name.is_empty() {
        application.name = name.clone();
    }
    if application.name != name {
        return error_response("application name does not match path", StatusCode::BAD_REQUEST)
            .into_response();
    }
    application.updated_at = epoch_secs();

    let errors = policy_errors(&application);
    match state.coordinator.store().put_application(&application) {
        Ok(()) => {
            info!(app = %name, nodes = application.nodes.len(), invalid_rules = errors.len(), "application stored");
            ApiResponse::ok(ApplicationResponse {
                application,
                policy_errors: errors,
            })
            .into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/applications/{name}/health
pub async fn application_health(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.store().get_application(&name) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("application not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response();
        }
    }
    match state.monitor.evaluate_once(&name).await {
        Some(report) => ApiResponse::ok(report).into_response(),
        None => error_response("no health signals configured", StatusCode::NOT_FOUND).into_response(),
    }
}

// ── Metrics ────────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let records = state.coordinator.snapshot().await;
    let body = crate::metrics::render_prometheus(&records);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_status_codes() {
        assert_eq!(status_for(ErrorKind::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
