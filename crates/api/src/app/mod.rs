//! HTTP application wiring (axum router + injected services).

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Extension, Router};

use flowbridge_engine::RunOrchestrator;
use flowbridge_upstream::{FlowCatalog, SessionManager};

pub mod dto;
pub mod errors;
pub mod routes;

/// Everything the route handlers need, wired once at startup.
pub struct AppServices {
    pub orchestrator: Arc<RunOrchestrator>,
    pub catalog: Arc<FlowCatalog>,
    pub session: Arc<SessionManager>,
}

/// Build the full HTTP router.
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/availability", get(routes::availability))
        .route("/flows", get(routes::list_flows))
        .route("/flows/:flow_key/input_schema", get(routes::input_schema))
        .route("/flows/:flow_key/start_job", post(routes::start_job))
        .route("/flows/:flow_key/status", get(routes::job_status))
        .layer(Extension(services))
}
