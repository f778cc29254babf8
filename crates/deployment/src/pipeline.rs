use std::collections::HashMap;

use chrono::Utc;
use forge_core_db::models::{
    job::Job,
    task::{Task, TaskKey, TaskStatus},
};
use forge_core_executors::{RepoGraph, TaskConfigError, TaskSpec};
use forge_core_services::{BlamelistEngine, NewTaskSpecsByState, TaskCache, Window};
use forge_core_utils::config::SchedulerConfig;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    candidate::{stole_from_failed_or_mishap, CandidateJob, TaskCandidate},
    scoring,
};

/// A string-pattern rule over (taskName, revision), applied during
/// filtering (spec.md §4.7 filter reason a).
#[derive(Debug, Clone)]
pub struct BlacklistRule {
    pub task_name_pattern: String,
    pub revision_pattern: String,
}

impl BlacklistRule {
    fn matches(&self, task_name: &str, revision: &str) -> bool {
        glob_match(&self.task_name_pattern, task_name) && glob_match(&self.revision_pattern, revision)
    }
}

/// Minimal `*`-glob matcher; sufficient for the blacklist's simple
/// string-pattern rules.
fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    pattern == value
}

/// Why a candidate did not make it into the accepted queue, kept for
/// diagnostics (spec.md §4.10 step 7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    Blacklisted,
    OutOfWindow,
    Superseded,
    AttemptsExhausted,
    UnmetDependencies,
}

/// **findTaskCandidatesForJobs** (spec.md §4.7 step 1): resolves and
/// merges candidates for every leaf task-spec of every unfinished job
/// still reachable in the repo graph.
pub fn find_task_candidates_for_jobs(
    jobs: &[Job],
    graph: &dyn RepoGraph,
    mut resolve_spec: impl FnMut(&Job, &str) -> Result<TaskSpec, TaskConfigError>,
) -> (Vec<TaskCandidate>, Vec<Uuid>) {
    let mut by_key: HashMap<(String, String, String, Option<Uuid>), TaskCandidate> = HashMap::new();
    let mut to_cancel = Vec::new();

    for job in jobs {
        // A history rewrite that drops the commit makes `get` return
        // None; such a job is orphaned and skipped this tick (spec.md
        // §4.7 step 1).
        if graph.get(&job.repo_state.repo, &job.repo_state.revision).is_none() {
            continue;
        }

        for ts_name in job.dependencies.keys() {
            let forced_job_id = job.is_force.then_some(job.id);
            let key = (job.repo_state.repo.clone(), job.repo_state.revision.clone(), ts_name.clone(), forced_job_id);

            match resolve_spec(job, ts_name) {
                Ok(spec) => {
                    let candidate = by_key.entry(key).or_insert_with(|| {
                        let mut c = TaskCandidate::new(job.repo_state.repo.clone(), job.repo_state.revision.clone(), ts_name.clone(), spec.clone());
                        c.forced_job_id = forced_job_id;
                        c.is_try_job = job.repo_state.is_try_job();
                        c
                    });
                    candidate.jobs.push(CandidateJob { job_id: job.id, priority: job.priority, created: job.created });
                }
                Err(err) if err.is_permanent() => {
                    to_cancel.push(job.id);
                }
                Err(_) => {
                    tracing::warn!(job = %job.id, task_spec = %ts_name, "transient task-config error, will retry next tick");
                }
            }
        }
    }

    (by_key.into_values().collect(), to_cancel)
}

/// **filterTaskCandidates** (spec.md §4.7 step 2).
pub fn filter_task_candidates(
    candidates: Vec<TaskCandidate>,
    window: &Window,
    task_cache: &TaskCache,
    blacklist: &[BlacklistRule],
) -> (Vec<TaskCandidate>, Vec<(TaskCandidate, FilterReason)>) {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    'candidates: for mut candidate in candidates {
        if blacklist.iter().any(|rule| rule.matches(&candidate.task_name, &candidate.revision)) {
            rejected.push((candidate, FilterReason::Blacklisted));
            continue;
        }

        if !candidate.is_try_job && !window.test_time(&candidate.repo, Utc::now()) && !window.test_commit(&candidate.repo, &candidate.revision) {
            rejected.push((candidate, FilterReason::OutOfWindow));
            continue;
        }

        let key = task_key_for(&candidate);
        let prior: Vec<Task> = task_cache.get_by_key(&key);

        if prior.iter().any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Running | TaskStatus::Success)) {
            rejected.push((candidate, FilterReason::Superseded));
            continue;
        }

        if let Some(latest) = prior.iter().max_by_key(|t| t.created) {
            if latest.attempt + 1 >= latest.max_attempts {
                rejected.push((candidate, FilterReason::AttemptsExhausted));
                continue;
            }
            candidate.attempt = latest.attempt + 1;
            candidate.retry_of = Some(latest.id);
            candidate.stole_from_failed_or_mishap = stole_from_failed_or_mishap(Some(latest.status));
        }

        let mut isolated_hashes = Vec::new();
        let mut parent_task_ids = Vec::new();
        for dep in &candidate.task_spec.dependencies {
            let dep_key = TaskKey::new(
                forge_core_db::models::repo_state::RepoState::new(candidate.repo.clone(), candidate.revision.clone()),
                dep.clone(),
            );
            let satisfied = task_cache
                .get_by_key(&dep_key)
                .into_iter()
                .filter(|t| t.status.is_success() && t.isolated_output.is_some())
                .max_by_key(|t| t.created);

            match satisfied {
                Some(t) => {
                    isolated_hashes.push(t.isolated_output.clone().expect("filtered for Some above"));
                    parent_task_ids.push(t.id);
                }
                None => {
                    rejected.push((candidate, FilterReason::UnmetDependencies));
                    continue 'candidates;
                }
            }
        }
        candidate.isolated_hashes = isolated_hashes;
        candidate.parent_task_ids = parent_task_ids;

        accepted.push(candidate);
    }

    (accepted, rejected)
}

fn task_key_for(candidate: &TaskCandidate) -> TaskKey {
    let repo_state = forge_core_db::models::repo_state::RepoState::new(candidate.repo.clone(), candidate.revision.clone());
    match candidate.forced_job_id {
        Some(job_id) => TaskKey::forced(repo_state, candidate.task_name.clone(), job_id),
        None => TaskKey::new(repo_state, candidate.task_name.clone()),
    }
}

/// **processTaskCandidates** (spec.md §4.7 step 3): computes the
/// blamelist and score for every surviving candidate. Stealing-target
/// updates (the complement subtraction) are the dispatcher's job once a
/// candidate is actually accepted, not this stage's.
pub fn process_task_candidates(
    mut candidates: Vec<TaskCandidate>,
    graph: &dyn RepoGraph,
    task_cache: &TaskCache,
    new_task_specs_by_state: &NewTaskSpecsByState<'_>,
    config: &SchedulerConfig,
) -> Vec<TaskCandidate> {
    let engine = BlamelistEngine::new(graph, task_cache);

    for candidate in &mut candidates {
        if candidate.forced_job_id.is_some() && !candidate.is_try_job {
            candidate.score = scoring::score_force_run(candidate, config);
            continue;
        }
        if candidate.is_try_job {
            candidate.score = scoring::score_try_job(candidate, config);
            continue;
        }

        let blamelist = engine.compute(&candidate.task_name, &candidate.repo, &candidate.revision, new_task_specs_by_state);
        candidate.commits = blamelist.commits;
        candidate.stealing_from_id = blamelist.stealing_from.as_ref().map(|s| s.task_id);

        let stole_from_len = blamelist
            .stealing_from
            .as_ref()
            .and_then(|s| task_cache.get_task_for_commit(&candidate.repo, &s.revision, &candidate.task_name))
            .map(|t| t.commits.len() as i64)
            .unwrap_or(0);

        let earliest_commit_time = graph
            .get(&candidate.repo, candidate.commits.last().unwrap_or(&candidate.revision))
            .map(|c| c.timestamp)
            .unwrap_or_else(Utc::now);

        candidate.score = scoring::score_regular(candidate, stole_from_len, earliest_commit_time, config);
    }

    // Sort by Score descending: this is the queue (spec.md §4.7 step 4).
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    candidates
}
