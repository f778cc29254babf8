use std::{
    collections::HashMap,
    sync::RwLock,
};

use chrono::{DateTime, Duration, Utc};
use forge_core_db::{
    models::{
        job::{Job, TaskSummary},
        task::{Task, TaskStatus},
    },
    retry_on_concurrent_update, Store, StoreError,
};
use forge_core_executors::{ExecutionService, ExecutionServiceError, TaskResult, TaskRunState};
use uuid::Uuid;

use crate::task_cache::TaskCache;

const NUM_RETRIES: u32 = 3;
/// How long a push notification for an id not yet known to the store is
/// given the benefit of the doubt before being treated as stale
/// (spec.md §4.11).
const REDELIVER_GRACE: Duration = Duration::minutes(2);

fn run_state_to_task_status(state: TaskRunState) -> Option<TaskStatus> {
    match state {
        TaskRunState::Completed => Some(TaskStatus::Success),
        TaskRunState::Expired | TaskRunState::Killed | TaskRunState::BotDied => Some(TaskStatus::Mishap),
        TaskRunState::Pending | TaskRunState::Running => None,
    }
}

/// What the push-notification handler tells its caller to do with the
/// delivery (spec.md §4.11).
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Redeliver,
    Acknowledge,
}

/// Tracks tasks between dispatch and completion via both poll and push
/// pathways (spec.md §4.11), and keeps job status derived from task
/// outcomes (`updateUnfinishedJobs`).
pub struct CompletionTracker {
    pending_insert: RwLock<std::collections::HashSet<Uuid>>,
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self { pending_insert: RwLock::new(std::collections::HashSet::new()) }
    }

    /// Marks `id` as freshly dispatched but not yet durably committed;
    /// push notifications for it are deferred until `remove_pending`.
    pub fn mark_pending(&self, id: Uuid) {
        self.pending_insert.write().expect("completion tracker lock poisoned").insert(id);
    }

    pub fn remove_pending(&self, id: Uuid) {
        self.pending_insert.write().expect("completion tracker lock poisoned").remove(&id);
    }

    fn is_pending(&self, id: Uuid) -> bool {
        self.pending_insert.read().expect("completion tracker lock poisoned").contains(&id)
    }

    /// Poll pathway: asks the execution service for the state of every
    /// unfinished task and applies any that have newly finished.
    pub async fn poll(
        &self,
        store: &dyn Store,
        exec: &dyn ExecutionService,
        unfinished: &[Task],
    ) -> Result<Vec<Task>, CompletionTrackerError> {
        let swarming_ids: Vec<String> =
            unfinished.iter().filter_map(|t| t.swarming_task_id.clone()).collect();
        if swarming_ids.is_empty() {
            return Ok(Vec::new());
        }

        let results = exec.list_task_results(&swarming_ids).await?;
        let by_swarming_id: HashMap<&str, &Task> = unfinished
            .iter()
            .filter_map(|t| t.swarming_task_id.as_deref().map(|id| (id, t)))
            .collect();

        let mut updated = Vec::new();
        for result in results {
            let Some(status) = run_state_to_task_status(result.state) else { continue };
            let Some(task) = by_swarming_id.get(result.swarming_task_id.as_str()) else { continue };
            updated.push(self.apply_execution_result(store, (*task).clone(), status, &result).await?);
        }
        Ok(updated)
    }

    /// Push pathway: decides whether to acknowledge or ask for
    /// redelivery, given the notification's own age and whether the
    /// task id is known to the store yet.
    pub fn handle_notification(&self, task_id: Uuid, task_known: bool, notified_at: DateTime<Utc>) -> PushOutcome {
        if self.is_pending(task_id) {
            return PushOutcome::Redeliver;
        }
        if !task_known && Utc::now() - notified_at < REDELIVER_GRACE {
            return PushOutcome::Redeliver;
        }
        PushOutcome::Acknowledge
    }

    /// Applies a completed execution result to a task through the same
    /// CAS-retrying write path poll uses (spec.md §4.11
    /// `UpdateDBFromSwarmingTask`).
    pub async fn apply_execution_result(
        &self,
        store: &dyn Store,
        mut task: Task,
        status: TaskStatus,
        result: &TaskResult,
    ) -> Result<Task, CompletionTrackerError> {
        task.status = status;
        task.isolated_output = result.isolated_output.clone();
        if task.finished.is_none() {
            task.finished = Some(Utc::now());
        }
        if task.started.is_none() {
            task.started = task.finished;
        }

        let saved = retry_on_concurrent_update(NUM_RETRIES, {
            let store = store;
            let task = task.clone();
            move || {
                let task = task.clone();
                async move { store.put_task(task).await }
            }
        })
        .await?;
        self.remove_pending(saved.id);
        Ok(saved)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionTrackerError {
    #[error(transparent)]
    Execution(#[from] ExecutionServiceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// `updateUnfinishedJobs` (spec.md §4.11): recomputes each unfinished
/// job's status from the task cache's current view of its dependencies,
/// writing back the job and any tasks whose `Jobs` list gained this
/// job's id.
pub async fn update_unfinished_jobs(
    store: &dyn Store,
    task_cache: &TaskCache,
    unfinished_jobs: &[Job],
) -> Result<Vec<Job>, StoreError> {
    let mut updated = Vec::new();

    for job in unfinished_jobs {
        let mut tasks_by_spec: HashMap<String, Vec<TaskSummary>> = HashMap::new();
        let mut newly_attached_tasks = Vec::new();

        for (spec_name, _deps) in &job.dependencies {
            let matching = task_cache
                .unfinished()
                .into_iter()
                .chain(std::iter::empty())
                .filter(|t| &t.key.name == spec_name && t.key.repo_state == job.repo_state)
                .collect::<Vec<_>>();

            let mut summaries = Vec::new();
            for task in matching {
                if !task.jobs.contains(&job.id) {
                    let mut attached = task.clone();
                    attached.jobs.push(job.id);
                    newly_attached_tasks.push(attached);
                }
                summaries.push(TaskSummary {
                    task_id: task.id,
                    attempt: task.attempt,
                    status: task.status,
                    max_attempts: task.max_attempts,
                });
            }
            tasks_by_spec.insert(spec_name.clone(), summaries);
        }

        if tasks_by_spec == job.tasks {
            continue;
        }

        let dependency_names: Vec<String> = job.dependencies.keys().cloned().collect();
        let new_status = Job::derive_status(&dependency_names, &tasks_by_spec);

        let mut next = job.clone();
        next.tasks = tasks_by_spec;
        let newly_done = new_status.is_done() && next.status != new_status;
        next.status = new_status;
        if newly_done && next.finished.is_none() {
            next.finished = Some(Utc::now());
        }

        for task in newly_attached_tasks {
            retry_on_concurrent_update(NUM_RETRIES, {
                let store = store;
                let task = task.clone();
                move || {
                    let task = task.clone();
                    async move { store.put_task(task).await }
                }
            })
            .await?;
        }

        let saved = retry_on_concurrent_update(NUM_RETRIES, {
            let store = store;
            let next = next.clone();
            move || {
                let next = next.clone();
                async move { store.put_job(next).await }
            }
        })
        .await?;
        updated.push(saved);
    }

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use forge_core_db::{models::repo_state::RepoState, InMemoryStore};
    use forge_core_executors::FakeExecutionService;

    use super::*;

    fn base_task(name: &str, status: TaskStatus, swarming_id: Option<&str>) -> Task {
        Task {
            id: Uuid::new_v4(),
            key: forge_core_db::models::task::TaskKey::new(RepoState::new("repo", "rev"), name),
            attempt: 0,
            status,
            retry_of: None,
            commits: vec![],
            jobs: vec![],
            parent_task_ids: vec![],
            isolated_input: None,
            isolated_output: None,
            created: Utc::now(),
            started: None,
            finished: None,
            swarming_task_id: swarming_id.map(str::to_string),
            max_attempts: 2,
            db_modified: 0,
        }
    }

    #[tokio::test]
    async fn poll_applies_finished_results_and_clears_pending() {
        let store = InMemoryStore::new();
        let exec = FakeExecutionService::new();
        let tracker = CompletionTracker::new();

        let mut task = base_task("Build", TaskStatus::Running, Some("swarm-1"));
        task = store.put_task(task).await.expect("insert");
        tracker.mark_pending(task.id);

        exec.set_result(
            "swarm-1",
            TaskResult {
                swarming_task_id: "swarm-1".into(),
                state: TaskRunState::Completed,
                isolated_output: Some("hash-out".into()),
                bot_id: Some("bot-1".into()),
            },
        );

        let updated = tracker.poll(&store, &exec, &[task.clone()]).await.expect("poll");
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].status, TaskStatus::Success);
        assert!(!tracker.is_pending(updated[0].id));
    }

    #[test]
    fn pending_id_always_asks_for_redelivery() {
        let tracker = CompletionTracker::new();
        let id = Uuid::new_v4();
        tracker.mark_pending(id);
        assert_eq!(tracker.handle_notification(id, true, Utc::now()), PushOutcome::Redeliver);
    }

    #[test]
    fn unknown_recent_task_asks_for_redelivery() {
        let tracker = CompletionTracker::new();
        let id = Uuid::new_v4();
        assert_eq!(tracker.handle_notification(id, false, Utc::now()), PushOutcome::Redeliver);
    }

    #[test]
    fn unknown_stale_task_is_acknowledged() {
        let tracker = CompletionTracker::new();
        let id = Uuid::new_v4();
        let old = Utc::now() - Duration::minutes(5);
        assert_eq!(tracker.handle_notification(id, false, old), PushOutcome::Acknowledge);
    }
}
