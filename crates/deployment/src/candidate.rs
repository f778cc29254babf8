use chrono::{DateTime, Utc};
use forge_core_db::models::task::TaskStatus;
use forge_core_executors::TaskSpec;
use uuid::Uuid;

/// A scheduler-internal object that may become a Task; never persisted
/// (spec.md §3).
#[derive(Debug, Clone)]
pub struct TaskCandidate {
    pub repo: String,
    pub revision: String,
    pub task_name: String,
    pub forced_job_id: Option<Uuid>,
    pub task_spec: TaskSpec,
    pub attempt: u32,
    pub retry_of: Option<Uuid>,
    pub stealing_from_id: Option<Uuid>,
    pub isolated_hashes: Vec<String>,
    pub parent_task_ids: Vec<Uuid>,
    pub commits: Vec<String>,
    pub score: f64,
    pub jobs: Vec<CandidateJob>,
    pub is_try_job: bool,
    /// Set when `StealingFrom` last finished FAILURE or MISHAP (spec.md
    /// §4.7.1 retry/bisect bonus).
    pub stole_from_failed_or_mishap: bool,
}

/// The subset of a requesting job's fields scoring needs.
#[derive(Debug, Clone)]
pub struct CandidateJob {
    pub job_id: Uuid,
    pub priority: f64,
    pub created: DateTime<Utc>,
}

impl TaskCandidate {
    pub fn new(repo: impl Into<String>, revision: impl Into<String>, task_name: impl Into<String>, task_spec: TaskSpec) -> Self {
        Self {
            repo: repo.into(),
            revision: revision.into(),
            task_name: task_name.into(),
            forced_job_id: None,
            task_spec,
            attempt: 0,
            retry_of: None,
            stealing_from_id: None,
            isolated_hashes: Vec::new(),
            parent_task_ids: Vec::new(),
            commits: Vec::new(),
            score: 0.0,
            jobs: Vec::new(),
            is_try_job: false,
            stole_from_failed_or_mishap: false,
        }
    }

    /// Stable identifier, analogous to `TaskKey::make_id` (spec.md §8
    /// round-trip law).
    pub fn make_id(&self) -> String {
        format!(
            "{}@{}|{}|{}",
            self.repo,
            self.revision,
            self.task_name,
            self.forced_job_id.map(|id| id.to_string()).unwrap_or_default()
        )
    }
}

/// True iff this most-recent prior attempt ended badly enough to earn
/// the retry/bisect score bonus.
pub fn stole_from_failed_or_mishap(status: Option<TaskStatus>) -> bool {
    matches!(status, Some(TaskStatus::Failure) | Some(TaskStatus::Mishap))
}
