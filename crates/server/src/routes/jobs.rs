use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::Json,
};
use forge_core_db::models::job::Job;
use forge_core_local_deployment::LocalDeployment;
use forge_core_utils::response::ApiResponse;
use serde::Deserialize;

use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    repo: Option<String>,
    #[serde(default = "default_true")]
    unfinished: bool,
}

fn default_true() -> bool {
    true
}

/// Jobs from the Job cache (spec.md §6), defaulting to unfinished jobs
/// only since that is what the scheduler actually keeps a full view of.
pub async fn get_jobs(
    State(deployment): State<Arc<LocalDeployment>>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<ApiResponse<Vec<Job>>>, ApiError> {
    let jobs = deployment.list_jobs(query.repo.as_deref(), query.unfinished);
    Ok(Json(ApiResponse::success(jobs)))
}
