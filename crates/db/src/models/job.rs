use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

use super::{repo_state::RepoState, task::TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, TS)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Success,
    Failure,
    Mishap,
    Canceled,
}

impl JobStatus {
    pub fn is_done(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// The most recent attempt's outcome for one task-spec dependency of a
/// job, as tracked in `Job.Tasks` (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct TaskSummary {
    pub task_id: Uuid,
    pub attempt: u32,
    pub status: TaskStatus,
    pub max_attempts: u32,
}

/// A materialized job record (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub repo_state: RepoState,
    pub created: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub is_force: bool,
    /// task-spec name -> transitive dependency task-spec names.
    pub dependencies: HashMap<String, Vec<String>>,
    /// task-spec name -> summaries of every attempt made for it.
    pub tasks: HashMap<String, Vec<TaskSummary>>,
    pub priority: f64,
    pub buildbucket_build_id: Option<i64>,
    pub buildbucket_lease_key: Option<i64>,
    pub db_modified: i64,
}

impl Job {
    /// `RepoState` carries a patch iff this is a try job.
    pub fn is_try_job(&self) -> bool {
        self.repo_state.is_try_job()
    }

    /// `Job.Status = DeriveStatus(tasks)` — a pure function of the latest
    /// Task per dependency. Applying it twice on unchanged input yields
    /// the same value (spec.md §8, invariant 10).
    pub fn derive_status(dependencies: &[String], tasks: &HashMap<String, Vec<TaskSummary>>) -> JobStatus {
        let mut all_succeeded = true;

        for dep in dependencies {
            let attempts = match tasks.get(dep) {
                Some(a) if !a.is_empty() => a,
                _ => {
                    all_succeeded = false;
                    continue;
                }
            };

            let latest = attempts
                .iter()
                .max_by_key(|summary| summary.attempt)
                .expect("non-empty attempts has a max");

            if latest.status.is_success() {
                continue;
            }

            all_succeeded = false;

            // Failed or mishap-ed: only a hard job failure once attempts are
            // exhausted. An in-flight retry keeps the job IN_PROGRESS.
            if latest.status.is_done() && latest.attempt + 1 >= latest.max_attempts {
                return if latest.status == TaskStatus::Mishap {
                    JobStatus::Mishap
                } else {
                    JobStatus::Failure
                };
            }
        }

        if all_succeeded {
            JobStatus::Success
        } else {
            JobStatus::InProgress
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(attempt: u32, status: TaskStatus, max_attempts: u32) -> TaskSummary {
        TaskSummary {
            task_id: Uuid::new_v4(),
            attempt,
            status,
            max_attempts,
        }
    }

    #[test]
    fn all_deps_succeeded_is_success() {
        let deps = vec!["build".to_string(), "test".to_string()];
        let mut tasks = HashMap::new();
        tasks.insert("build".to_string(), vec![summary(0, TaskStatus::Success, 2)]);
        tasks.insert("test".to_string(), vec![summary(0, TaskStatus::Success, 2)]);
        assert_eq!(Job::derive_status(&deps, &tasks), JobStatus::Success);
    }

    #[test]
    fn missing_dep_is_in_progress() {
        let deps = vec!["build".to_string()];
        let tasks = HashMap::new();
        assert_eq!(Job::derive_status(&deps, &tasks), JobStatus::InProgress);
    }

    #[test]
    fn exhausted_failing_attempts_is_failure() {
        let deps = vec!["build".to_string()];
        let mut tasks = HashMap::new();
        tasks.insert("build".to_string(), vec![summary(1, TaskStatus::Failure, 2)]);
        assert_eq!(Job::derive_status(&deps, &tasks), JobStatus::Failure);
    }

    #[test]
    fn exhausted_mishap_is_mishap() {
        let deps = vec!["build".to_string()];
        let mut tasks = HashMap::new();
        tasks.insert("build".to_string(), vec![summary(1, TaskStatus::Mishap, 2)]);
        assert_eq!(Job::derive_status(&deps, &tasks), JobStatus::Mishap);
    }

    #[test]
    fn in_flight_retry_is_not_yet_a_failure() {
        let deps = vec!["build".to_string()];
        let mut tasks = HashMap::new();
        // Attempt 0 failed but max_attempts=2 means attempt 1 can still run.
        tasks.insert("build".to_string(), vec![summary(0, TaskStatus::Failure, 2)]);
        assert_eq!(Job::derive_status(&deps, &tasks), JobStatus::InProgress);
    }

    #[test]
    fn derive_status_is_a_pure_function() {
        let deps = vec!["build".to_string()];
        let mut tasks = HashMap::new();
        tasks.insert("build".to_string(), vec![summary(0, TaskStatus::Success, 2)]);
        let first = Job::derive_status(&deps, &tasks);
        let second = Job::derive_status(&deps, &tasks);
        assert_eq!(first, second);
    }
}
