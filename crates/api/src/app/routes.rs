//! HTTP route handlers.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::{Extension, Json};
use serde_json::{json, Value};
use tracing::info;

use flowbridge_core::RunId;

use super::dto::{
    FlowSummary, JobStatusQuery, JobStatusResponse, StartJobRequest, StartJobResponse,
};
use super::errors::ApiError;
use super::AppServices;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Upstream channel availability, for load balancers and operators.
pub async fn availability(
    Extension(services): Extension<Arc<AppServices>>,
) -> Json<Value> {
    let health = services.session.connection_health().await;
    let status = if health.is_healthy { "available" } else { "unavailable" };
    Json(json!({ "status": status, "upstream": health }))
}

pub async fn list_flows(
    Extension(services): Extension<Arc<AppServices>>,
) -> Result<Json<Vec<FlowSummary>>, ApiError> {
    let flows = services.catalog.flows().await?;
    let mut summaries: Vec<FlowSummary> = flows.values().map(FlowSummary::from).collect();
    summaries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(Json(summaries))
}

/// Pass the flow's input-schema document through untouched.
pub async fn input_schema(
    Extension(services): Extension<Arc<AppServices>>,
    Path(flow_key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let schema = services.catalog.schema(&flow_key).await?;
    Ok(Json(schema))
}

pub async fn start_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(flow_key): Path<String>,
    Json(request): Json<StartJobRequest>,
) -> Result<Json<StartJobResponse>, ApiError> {
    if request.identifier_from_purchaser.is_empty() {
        return Err(ApiError::bad_request("identifier_from_purchaser is required"));
    }

    let run = services
        .orchestrator
        .create_run(
            &flow_key,
            request.input_data,
            &request.identifier_from_purchaser,
        )
        .await?;

    info!(run_id = %run.id, flow_key = %flow_key, "job started via API");
    Ok(Json(StartJobResponse::from_run(&run)))
}

pub async fn job_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(_flow_key): Path<String>,
    Query(query): Query<JobStatusQuery>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let run_id = RunId::from_str(&query.job_id)
        .map_err(|_| ApiError::bad_request("invalid job_id format"))?;

    let run = services
        .orchestrator
        .store()
        .get(run_id)
        .await?
        .ok_or_else(|| ApiError::not_found("job not found"))?;

    Ok(Json(JobStatusResponse::from_run(&run)))
}
