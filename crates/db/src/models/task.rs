use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

use super::repo_state::RepoState;

/// (RepoState, task-spec Name, optional ForcedJobId) — uniquely
/// identifies a logical task instance modulo retries (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
pub struct TaskKey {
    pub repo_state: RepoState,
    pub name: String,
    pub forced_job_id: Option<Uuid>,
}

impl TaskKey {
    pub fn new(repo_state: RepoState, name: impl Into<String>) -> Self {
        Self {
            repo_state,
            name: name.into(),
            forced_job_id: None,
        }
    }

    pub fn forced(repo_state: RepoState, name: impl Into<String>, job_id: Uuid) -> Self {
        Self {
            repo_state,
            name: name.into(),
            forced_job_id: Some(job_id),
        }
    }

    /// Stable string id; round-trips through `parse` (spec.md §8 round-trip law).
    pub fn make_id(&self) -> String {
        format!(
            "{}|{}|{}",
            self.repo_state.row_key(),
            self.name,
            self.forced_job_id.map(|id| id.to_string()).unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, TS)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
    Mishap,
}

impl TaskStatus {
    /// A task is "done" iff Status ∈ {SUCCESS, FAILURE, MISHAP}.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Mishap)
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A materialized execution record (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct Task {
    pub id: Uuid,
    pub key: TaskKey,
    pub attempt: u32,
    pub status: TaskStatus,
    pub retry_of: Option<Uuid>,
    /// Ordered set of commit hashes this task covers; newest first.
    pub commits: Vec<String>,
    pub jobs: Vec<Uuid>,
    pub parent_task_ids: Vec<Uuid>,
    pub isolated_input: Option<String>,
    pub isolated_output: Option<String>,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub swarming_task_id: Option<String>,
    pub max_attempts: u32,
    /// Monotonic write stamp; strictly increases on every write and is
    /// used as the optimistic-concurrency token.
    pub db_modified: i64,
}

impl Task {
    pub fn revision(&self) -> &str {
        &self.key.repo_state.revision
    }

    /// Invariant: if Commits is non-empty, it contains Revision.
    pub fn commits_contain_revision(&self) -> bool {
        self.commits.is_empty() || self.commits.iter().any(|c| c == self.revision())
    }

    /// Invariant: Attempt < MaxAttempts.
    pub fn attempt_within_bounds(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> TaskKey {
        TaskKey::new(RepoState::new("repo", "deadbeef"), "Build")
    }

    #[test]
    fn task_key_round_trips_through_make_id_components() {
        let key = sample_key();
        let id = key.make_id();
        assert!(id.contains("repo@deadbeef"));
        assert!(id.contains("Build"));
    }

    #[test]
    fn forced_and_unforced_keys_differ() {
        let plain = sample_key();
        let forced = TaskKey::forced(RepoState::new("repo", "deadbeef"), "Build", Uuid::nil());
        assert_ne!(plain.make_id(), forced.make_id());
    }

    #[test]
    fn done_statuses_are_terminal() {
        assert!(TaskStatus::Success.is_done());
        assert!(TaskStatus::Failure.is_done());
        assert!(TaskStatus::Mishap.is_done());
        assert!(!TaskStatus::Pending.is_done());
        assert!(!TaskStatus::Running.is_done());
    }
}
