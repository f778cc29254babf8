use std::collections::HashMap;

use chrono::Utc;
use forge_core_db::{
    models::{repo_state::RepoState, task::{Task, TaskKey}},
    retry_on_concurrent_update, Store, StoreError,
};
use forge_core_executors::{substitute_variables, ExecutionService, ExecutionServiceError, IsolateClient, IsolateError, TriggerRequest};
use forge_core_services::{complement, CompletionTracker, TaskCache};
use forge_core_utils::config::SchedulerConfig;
use thiserror::Error;
use uuid::Uuid;

use crate::bot_matcher::MatchedCandidate;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to re-upload isolated input {0}: {1}")]
    Isolate(String, IsolateError),
    #[error("execution service rejected trigger: {0}")]
    Execution(#[from] ExecutionServiceError),
    #[error("store rejected task after retries: {0}")]
    Store(#[from] StoreError),
}

pub struct DispatchOutcome {
    pub triggered: Vec<Task>,
    pub failed: Vec<(String, DispatchError)>,
}

fn substitution_values(candidate: &MatchedCandidate, task_id: Uuid) -> HashMap<String, String> {
    let c = &candidate.candidate;
    let mut values = HashMap::from([
        ("REPO".to_string(), c.repo.clone()),
        ("REVISION".to_string(), c.revision.clone()),
        ("TASK_NAME".to_string(), c.task_name.clone()),
        ("TASK_ID".to_string(), task_id.to_string()),
    ]);
    if let Some(job) = c.jobs.first() {
        values.insert("BUILDBUCKET_BUILD_ID".to_string(), job.job_id.to_string());
    }
    values
}

fn substitute_all(items: &[String], values: &HashMap<String, String>) -> Vec<String> {
    items.iter().map(|item| substitute_variables(item, values)).collect()
}

/// Resolves a candidate's isolated inputs (re-uploading each referenced
/// hash for a stable digest) and builds the wire-format trigger request
/// (spec.md §4.9 step 1-2).
async fn build_trigger_request(
    matched: &MatchedCandidate,
    task_id: Uuid,
    isolate: &dyn IsolateClient,
) -> Result<TriggerRequest, DispatchError> {
    let candidate = &matched.candidate;
    let mut stable_hashes = Vec::with_capacity(candidate.isolated_hashes.len());
    for digest in &candidate.isolated_hashes {
        let stable = isolate
            .re_upload_isolated_files(digest)
            .await
            .map_err(|err| DispatchError::Isolate(digest.clone(), err))?;
        stable_hashes.push(stable);
    }

    let values = substitution_values(matched, task_id);
    let spec = &candidate.task_spec;

    Ok(TriggerRequest {
        name: spec.name.clone(),
        command: substitute_all(&spec.command, &values),
        dimensions: spec.dimensions.clone(),
        env: spec.env.iter().map(|(k, v)| (k.clone(), substitute_variables(v, &values))).collect(),
        isolated_input: stable_hashes.into_iter().next(),
        expiration_secs: spec.expiration_secs,
        execution_timeout_secs: spec.execution_timeout_secs,
        io_timeout_secs: spec.io_timeout_secs,
        priority: spec.priority,
        service_account: spec.service_account.clone(),
        tags: {
            let mut tags = substitute_all(&spec.extra_tags, &values);
            // Idempotent only for unforced candidates: a forced run is
            // explicitly requested again and must not be deduped against
            // a prior attempt (spec.md §4.9).
            if candidate.forced_job_id.is_none() {
                tags.push(format!("idempotency_key:{}@{}|{}", candidate.repo, candidate.revision, candidate.task_name));
            }
            tags
        },
    })
}

fn new_task(matched: &MatchedCandidate, task_id: Uuid, swarming_task_id: String, deduped: bool) -> Task {
    let candidate = &matched.candidate;
    let created = Utc::now();
    Task {
        id: task_id,
        key: match candidate.forced_job_id {
            Some(job_id) => TaskKey::forced(RepoState::new(candidate.repo.clone(), candidate.revision.clone()), candidate.task_name.clone(), job_id),
            None => TaskKey::new(RepoState::new(candidate.repo.clone(), candidate.revision.clone()), candidate.task_name.clone()),
        },
        attempt: candidate.attempt,
        status: forge_core_db::models::task::TaskStatus::Pending,
        retry_of: candidate.retry_of,
        commits: candidate.commits.clone(),
        jobs: candidate.jobs.iter().map(|j| j.job_id).collect(),
        parent_task_ids: candidate.parent_task_ids.clone(),
        isolated_input: candidate.isolated_hashes.first().cloned(),
        isolated_output: None,
        created,
        started: deduped.then_some(created),
        finished: deduped.then_some(created),
        swarming_task_id: Some(swarming_task_id),
        max_attempts: candidate.task_spec.max_attempts,
        db_modified: 0,
    }
}

/// Triggers every matched candidate, assigns it a durable id, and
/// persists it (and any task it steals commits from) with CAS retry
/// (spec.md §4.9).
pub async fn dispatch_candidates(
    matched: Vec<MatchedCandidate>,
    store: &dyn Store,
    exec: &dyn ExecutionService,
    isolate: &dyn IsolateClient,
    tracker: &CompletionTracker,
    task_cache: &TaskCache,
    config: &SchedulerConfig,
) -> DispatchOutcome {
    let mut triggered = Vec::new();
    let mut failed = Vec::new();
    let mut seen_swarming_ids: HashMap<String, Uuid> = HashMap::new();

    let mut pending = matched;
    pending.sort_by_key(|m| m.candidate.make_id());

    for matched_candidate in pending {
        let task_id = Uuid::new_v4();
        tracker.mark_pending(task_id);

        let outcome = dispatch_one(&matched_candidate, task_id, store, exec, isolate, task_cache, config, &mut seen_swarming_ids).await;
        match outcome {
            Ok(task) => {
                tracker.remove_pending(task.id);
                triggered.push(task);
            }
            Err(err) => {
                tracker.remove_pending(task_id);
                failed.push((matched_candidate.candidate.make_id(), err));
            }
        }
    }

    DispatchOutcome { triggered, failed }
}

async fn dispatch_one(
    matched: &MatchedCandidate,
    task_id: Uuid,
    store: &dyn Store,
    exec: &dyn ExecutionService,
    isolate: &dyn IsolateClient,
    task_cache: &TaskCache,
    config: &SchedulerConfig,
    seen_swarming_ids: &mut HashMap<String, Uuid>,
) -> Result<Task, DispatchError> {
    let request = build_trigger_request(matched, task_id, isolate).await?;
    let result = exec.trigger_task(request).await?;

    let deduped = seen_swarming_ids.contains_key(&result.swarming_task_id);
    seen_swarming_ids.entry(result.swarming_task_id.clone()).or_insert(task_id);

    let task = new_task(matched, task_id, result.swarming_task_id, deduped);

    let saved = retry_on_concurrent_update(config.num_retries, {
        let store = store;
        let task = task.clone();
        move || {
            let task = task.clone();
            async move { store.put_task(task).await }
        }
    })
    .await?;

    task_cache.apply(vec![saved.clone()]);

    if let Some(stealing_from_id) = matched.candidate.stealing_from_id {
        if let Some(mut stolen_from) = task_cache.get_by_id(stealing_from_id) {
            let remaining = complement(&stolen_from.commits, &saved.commits);
            if remaining != stolen_from.commits {
                stolen_from.commits = remaining;
                if let Ok(updated) = retry_on_concurrent_update(config.num_retries, {
                    let store = store;
                    let stolen_from = stolen_from.clone();
                    move || {
                        let stolen_from = stolen_from.clone();
                        async move { store.put_task(stolen_from).await }
                    }
                })
                .await
                {
                    task_cache.apply(vec![updated]);
                }
            }
        }
    }

    Ok(saved)
}

#[cfg(test)]
mod tests {
    use forge_core_db::InMemoryStore;
    use forge_core_executors::{InMemoryIsolateClient, IsolatedFile, TaskSpec};

    use super::*;
    use crate::candidate::TaskCandidate;

    fn matched(task_name: &str, score: f64) -> MatchedCandidate {
        let mut spec = TaskSpec::default();
        spec.name = task_name.to_string();
        spec.command = vec!["run".into(), "--rev=<(REVISION)>".into()];
        let mut candidate = TaskCandidate::new("repo", "rev", task_name, spec);
        candidate.score = score;
        candidate.commits = vec!["rev".to_string()];
        MatchedCandidate { candidate, bot_id: "bot-1".into() }
    }

    #[tokio::test]
    async fn dispatch_persists_a_triggered_task() {
        let store = InMemoryStore::new();
        let exec = forge_core_executors::FakeExecutionService::new();
        let isolate = InMemoryIsolateClient::new();
        let tracker = CompletionTracker::new();
        let task_cache = TaskCache::new();
        let config = SchedulerConfig::default();

        let outcome = dispatch_candidates(vec![matched("Build", 5.0)], &store, &exec, &isolate, &tracker, &task_cache, &config).await;

        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.triggered.len(), 1);
        assert_eq!(outcome.triggered[0].key.name, "Build");
        assert!(!outcome.triggered[0].id.is_nil());
    }

    #[tokio::test]
    async fn trigger_request_substitutes_revision_into_the_command() {
        let isolate = InMemoryIsolateClient::new();
        let request = build_trigger_request(&matched("Build", 5.0), Uuid::new_v4(), &isolate).await.expect("build request");
        assert_eq!(request.command, vec!["run".to_string(), "--rev=rev".to_string()]);
    }

    #[tokio::test]
    async fn dispatch_reports_isolate_failures_without_aborting_the_batch() {
        let store = InMemoryStore::new();
        let exec = forge_core_executors::FakeExecutionService::new();
        let isolate = InMemoryIsolateClient::new();
        let tracker = CompletionTracker::new();
        let task_cache = TaskCache::new();
        let config = SchedulerConfig::default();

        let mut bad = matched("Flaky", 1.0);
        bad.candidate.isolated_hashes = vec!["missing-digest".to_string()];
        let good = matched("Build", 1.0);

        let outcome = dispatch_candidates(vec![bad, good], &store, &exec, &isolate, &tracker, &task_cache, &config).await;
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.triggered.len(), 1);
    }

    #[test]
    fn isolated_file_helper_is_available_for_fixture_seeding() {
        let client = InMemoryIsolateClient::new();
        let digest = client.put(IsolatedFile::new(b"payload".to_vec()));
        assert!(!digest.is_empty());
    }
}
