use std::sync::Arc;

use axum::{extract::State, response::Json};
use chrono::{DateTime, Utc};
use forge_core_deployment::Deployment;
use forge_core_local_deployment::LocalDeployment;
use forge_core_utils::response::ApiResponse;
use serde::Serialize;

use crate::error::ApiError;

/// Summary of the last tick, without the full candidate queue (spec.md
/// §6: "last tick's start/end timestamps and aggregated error").
#[derive(Debug, Serialize)]
pub struct TickSummary {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub candidate_count: usize,
    pub free_bot_count: usize,
    pub error: Option<String>,
}

pub async fn get_tick(State(deployment): State<Arc<LocalDeployment>>) -> Result<Json<ApiResponse<Option<TickSummary>>>, ApiError> {
    let summary = deployment.last_tick().map(|report| TickSummary {
        start: report.start,
        end: report.end,
        candidate_count: report.candidates.len(),
        free_bot_count: report.free_bots.len(),
        error: report.error,
    });
    Ok(Json(ApiResponse::success(summary)))
}
