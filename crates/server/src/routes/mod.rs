pub mod health;
pub mod jobs;
pub mod queue;
pub mod tasks;
pub mod tick;

use std::sync::Arc;

use axum::{routing::get, Router};
use forge_core_local_deployment::LocalDeployment;

/// The scheduler's HTTP diagnostics/status surface (spec.md §6).
pub fn router(deployment: Arc<LocalDeployment>) -> Router {
    let router = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/queue", get(queue::get_queue))
        .route("/api/jobs", get(jobs::get_jobs))
        .route("/api/tasks", get(tasks::get_task))
        .route("/api/tick", get(tick::get_tick))
        .with_state(deployment);

    crate::middleware::apply(router)
}
