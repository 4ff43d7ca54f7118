//! grayline-api — REST control surface for Grayline.
//!
//! A thin axum layer over the rollout coordinator. Every response uses the
//! `{ success, data, error }` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/deployments` | List deployments (`app`, `status`, `page`, `page_size`) |
//! | POST | `/api/v1/deployments` | Create a deployment |
//! | GET | `/api/v1/deployments/{id}` | Deployment detail with nodes |
//! | POST | `/api/v1/deployments/{id}/cancel` | Cancel the whole deployment |
//! | POST | `/api/v1/deployments/{id}/rollback` | Roll back the whole deployment |
//! | POST | `/api/v1/deployments/{id}/nodes/{action}` | Batch node action |
//! | GET | `/api/v1/deployments/{id}/report` | Diagnostic report |
//! | GET | `/api/v1/applications` | List applications |
//! | GET | `/api/v1/applications/{name}` | Get an application |
//! | PUT | `/api/v1/applications/{name}` | Store an application record |
//! | GET | `/api/v1/applications/{name}/health` | Evaluate health now |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod metrics;

use axum::Router;
use axum::routing::{get, post};
use grayline_health::HealthMonitor;
use grayline_rollout::Coordinator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Coordinator,
    pub monitor: HealthMonitor,
}

pub fn build_router(coordinator: Coordinator, monitor: HealthMonitor) -> Router {
    let state = ApiState {
        coordinator,
        monitor,
    };

    let api_routes = Router::new()
        .route(
            "/deployments",
            get(handlers::list_deployments).post(handlers::create_deployment),
        )
        .route("/deployments/{id}", get(handlers::get_deployment))
        .route("/deployments/{id}/cancel", post(handlers::cancel_deployment))
        .route("/deployments/{id}/rollback", post(handlers::rollback_deployment))
        .route("/deployments/{id}/nodes/{action}", post(handlers::node_action))
        .route("/deployments/{id}/report", get(handlers::get_report))
        .route("/applications", get(handlers::list_applications))
        .route(
            "/applications/{name}",
            get(handlers::get_application).put(handlers::put_application),
        )
        .route("/applications/{name}/health", get(handlers::application_health))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
        .route("/healthz", get(|| async { "ok" }))
}
