use std::sync::Arc;

use axum::{extract::State, response::Json};
use forge_core_deployment::{CandidateReport, Deployment};
use forge_core_local_deployment::LocalDeployment;
use forge_core_utils::response::ApiResponse;

use crate::error::ApiError;

/// The most recent tick's ordered candidate queue (spec.md §6).
pub async fn get_queue(State(deployment): State<Arc<LocalDeployment>>) -> Result<Json<ApiResponse<Vec<CandidateReport>>>, ApiError> {
    let candidates = deployment.last_tick().map(|report| report.candidates).unwrap_or_default();
    Ok(Json(ApiResponse::success(candidates)))
}
