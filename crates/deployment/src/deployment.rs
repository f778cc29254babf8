use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forge_core_executors::BotInfo;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::FilterReason;

/// What became of one candidate by the end of a tick, for diagnostics
/// (spec.md §4.10 step 7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CandidateOutcome {
    Filtered { reason: FilterReason },
    Queued,
    Matched { bot_id: String },
    Dispatched { task_id: Uuid },
    DispatchFailed { error: String },
}

/// One row of the diagnostics candidate list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateReport {
    pub id: String,
    pub repo: String,
    pub revision: String,
    pub task_name: String,
    pub score: f64,
    pub outcome: CandidateOutcome,
}

/// The JSON document a tick emits (spec.md §4.10 step 7): start/end
/// timestamps, the sorted candidate list annotated with its outcome,
/// the free-bot list, and any top-level error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub candidates: Vec<CandidateReport>,
    pub free_bots: Vec<BotInfo>,
    pub error: Option<String>,
}

/// Drives one scheduling tick and exposes the outcome of the most
/// recent one, matching the teacher's pattern of a single top-level
/// trait (`server/src/lib.rs`'s `DeploymentImpl` alias) the HTTP
/// surface and binary entrypoint depend on rather than a concrete type.
#[async_trait]
pub trait Deployment: Send + Sync {
    async fn tick(&self) -> TickReport;
    fn last_tick(&self) -> Option<TickReport>;
}
