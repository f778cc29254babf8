use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::Json,
};
use forge_core_db::models::task::Task;
use forge_core_local_deployment::LocalDeployment;
use forge_core_utils::response::ApiResponse;
use serde::Deserialize;

use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct TaskQuery {
    repo: String,
    commit: String,
    task_spec: String,
}

/// A task by its commit-index key (spec.md §6: "tasks from the Task
/// cache, by-commit index").
pub async fn get_task(
    State(deployment): State<Arc<LocalDeployment>>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<ApiResponse<Option<Task>>>, ApiError> {
    let task = deployment.task_for_commit(&query.repo, &query.commit, &query.task_spec);
    Ok(Json(ApiResponse::success(task)))
}
