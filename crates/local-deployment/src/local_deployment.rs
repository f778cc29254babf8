use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use forge_core_db::{
    models::{
        job::{Job, JobStatus},
        repo_state::RepoState,
        task::Task,
    },
    retry_on_concurrent_update, Store,
};
use forge_core_deployment::{
    dispatch_candidates, filter_task_candidates, find_task_candidates_for_jobs, match_bots_to_candidates,
    process_task_candidates, BlacklistRule, CandidateOutcome, CandidateReport, Deployment, TickReport,
};
use forge_core_executors::{BotInfo, ExecutionService, IsolateClient, ReviewServiceClient, TaskConfigError, TaskConfigReader, TasksCfg};
use forge_core_services::{update_unfinished_jobs, CompletionTracker, JobCache, TaskCache, TryJobIntegrator, Window};
use forge_core_utils::config::SchedulerConfig;
use uuid::Uuid;

use crate::diagnostics::DiagnosticsSink;

/// Reconstructs a `TaskCandidate::make_id()`-compatible key from a
/// persisted task, to correlate a dispatched `Task` back to the
/// candidate it came from when assembling tick diagnostics.
fn candidate_id_for_task(task: &Task) -> String {
    format!(
        "{}@{}|{}|{}",
        task.key.repo_state.repo,
        task.key.repo_state.revision,
        task.key.name,
        task.key.forced_job_id.map(|id| id.to_string()).unwrap_or_default()
    )
}

/// Key a `TasksCfg` is resolved once per tick for: the same repo,
/// revision and patch always share a config (spec.md §4.2).
type ConfigKey = (String, String, Option<String>);

fn config_key_for(repo_state: &RepoState) -> ConfigKey {
    (repo_state.repo.clone(), repo_state.revision.clone(), repo_state.patch.as_ref().map(|p| p.patch_repo.clone().unwrap_or_default()))
}

/// Single-process deployment of the scheduler: owns every in-process
/// component (caches, window, completion tracker) and the clients to
/// the four external collaborators, and drives the main loop plus the
/// independent periodic tasks (spec.md §4.10/§5).
pub struct LocalDeployment {
    store: Arc<dyn Store>,
    graph: Arc<dyn forge_core_executors::RepoGraph>,
    task_cache: Arc<TaskCache>,
    job_cache: Arc<JobCache>,
    window: Arc<Window>,
    exec: Arc<dyn ExecutionService>,
    isolate: Arc<dyn IsolateClient>,
    review: Arc<dyn ReviewServiceClient>,
    task_config: Arc<dyn TaskConfigReader>,
    tracker: Arc<CompletionTracker>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    config: SchedulerConfig,
    repos: Vec<String>,
    pools: Vec<Vec<String>>,
    blacklist: RwLock<Vec<BlacklistRule>>,
    /// Bots this deployment has just handed work to, kept around until
    /// the execution service's own view catches up with the dispatch
    /// (spec.md §4.10.1).
    busy: Mutex<HashMap<String, chrono::DateTime<Utc>>>,
    last_tick: RwLock<Option<TickReport>>,
    tick_lock: tokio::sync::Mutex<()>,
}

impl LocalDeployment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        graph: Arc<dyn forge_core_executors::RepoGraph>,
        exec: Arc<dyn ExecutionService>,
        isolate: Arc<dyn IsolateClient>,
        review: Arc<dyn ReviewServiceClient>,
        task_config: Arc<dyn TaskConfigReader>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        config: SchedulerConfig,
        repos: Vec<String>,
        pools: Vec<Vec<String>>,
    ) -> Self {
        let window = Window::new(chrono::Duration::seconds(config.window_period_secs as i64), config.window_num_commits as usize);
        Self {
            store,
            graph,
            task_cache: Arc::new(TaskCache::new()),
            job_cache: Arc::new(JobCache::new()),
            window: Arc::new(window),
            exec,
            isolate,
            review,
            task_config,
            tracker: Arc::new(CompletionTracker::new()),
            diagnostics,
            config,
            repos,
            pools,
            blacklist: RwLock::new(Vec::new()),
            busy: Mutex::new(HashMap::new()),
            last_tick: RwLock::new(None),
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn task_cache(&self) -> Arc<TaskCache> {
        Arc::clone(&self.task_cache)
    }

    pub fn job_cache(&self) -> Arc<JobCache> {
        Arc::clone(&self.job_cache)
    }

    pub fn set_blacklist(&self, rules: Vec<BlacklistRule>) {
        *self.blacklist.write().expect("blacklist lock poisoned") = rules;
    }

    /// Jobs from the Job cache (spec.md §6 HTTP surface `/api/jobs`),
    /// optionally restricted to one repo and to still-unfinished jobs.
    pub fn list_jobs(&self, repo: Option<&str>, unfinished_only: bool) -> Vec<Job> {
        let mut jobs = if unfinished_only {
            self.job_cache.unfinished()
        } else {
            self.job_cache.from_date_range(chrono::DateTime::<Utc>::MIN_UTC, Utc::now())
        };
        if let Some(repo) = repo {
            jobs.retain(|job| job.repo_state.repo == repo);
        }
        jobs
    }

    /// A task by its commit-index key (spec.md §6 HTTP surface
    /// `/api/tasks`).
    pub fn task_for_commit(&self, repo: &str, commit: &str, task_name: &str) -> Option<Task> {
        self.task_cache.get_task_for_commit(repo, commit, task_name)
    }

    fn window_start_map(&self) -> HashMap<String, chrono::DateTime<Utc>> {
        self.repos.iter().filter_map(|repo| self.window.start(repo).map(|start| (repo.clone(), start))).collect()
    }

    /// §4.10.1: fetches free bots per pool concurrently, then subtracts
    /// bots this deployment recently triggered but whose busy status the
    /// execution service hasn't reported back yet.
    async fn list_free_bots(&self) -> Vec<BotInfo> {
        let futs = self.pools.iter().map(|dims| {
            let exec = Arc::clone(&self.exec);
            let dims = dims.clone();
            async move {
                exec.list_free_bots(&dims).await.unwrap_or_else(|err| {
                    tracing::warn!(%err, "pool bot listing failed");
                    Vec::new()
                })
            }
        });
        let results = futures::future::join_all(futs).await;

        let grace = chrono::Duration::seconds(self.config.main_loop_period_secs as i64 * 3);
        let now = Utc::now();
        let busy = self.busy.lock().expect("busy lock poisoned");

        let mut seen = HashSet::new();
        results
            .into_iter()
            .flatten()
            .filter(|bot| seen.insert(bot.bot_id.clone()))
            .filter(|bot| match busy.get(&bot.bot_id) {
                Some(since) => now - *since > grace,
                None => true,
            })
            .collect()
    }

    fn mark_busy(&self, bot_ids: impl Iterator<Item = String>) {
        let now = Utc::now();
        let mut busy = self.busy.lock().expect("busy lock poisoned");
        for bot_id in bot_ids {
            busy.insert(bot_id, now);
        }
    }

    /// Refreshes the Task/Job caches from the store over each repo's
    /// current window, then recomputes unfinished job status (spec.md
    /// §4.10 step 2).
    async fn refresh_caches(&self) -> Result<(), forge_core_db::StoreError> {
        for repo in &self.repos {
            if let Err(err) = self.graph.update(repo) {
                tracing::warn!(%err, repo, "repo graph update failed during cache refresh");
            }
            self.window.update(repo, self.graph.as_ref());
        }

        let starts = self.window_start_map();
        let now = Utc::now();

        let mut fresh_tasks = Vec::new();
        let mut fresh_jobs = Vec::new();
        for (repo, start) in &starts {
            fresh_tasks.extend(self.store.get_tasks_from_date_range(*start, now, Some(repo)).await?);
            fresh_jobs.extend(self.store.get_jobs_from_date_range(*start, now, Some(repo)).await?);
        }

        self.task_cache.expire_and_update(&starts, fresh_tasks);
        self.job_cache.expire_and_update(&starts, fresh_jobs);

        let unfinished = self.job_cache.unfinished();
        let updated = update_unfinished_jobs(self.store.as_ref(), &self.task_cache, &unfinished).await?;
        self.job_cache.apply(updated.clone());

        self.complete_finished_try_jobs(updated).await;

        Ok(())
    }

    /// C12 completion pathway (spec.md §4.12 "Completion"): a try job
    /// that just finished and still holds a review-service lease has its
    /// outcome reported back, then the lease is cleared in the cache.
    async fn complete_finished_try_jobs(&self, jobs: Vec<Job>) {
        let integrator = TryJobIntegrator::new(self.review.as_ref());
        for job in jobs {
            if !job.is_try_job() || job.buildbucket_lease_key.is_none() || !job.status.is_done() {
                continue;
            }
            match integrator.complete(self.store.as_ref(), job).await {
                Ok(saved) => self.job_cache.apply(vec![saved]),
                Err(err) => tracing::warn!(%err, "failed to report try-job completion"),
            }
        }
    }

    /// Resolves the distinct `TasksCfg`s needed by this batch of jobs
    /// once, asynchronously, so C7's candidate search can stay a
    /// synchronous closure over the result.
    async fn resolve_configs(&self, jobs: &[Job]) -> HashMap<ConfigKey, Result<TasksCfg, TaskConfigError>> {
        let mut keys: HashSet<ConfigKey> = HashSet::new();
        for job in jobs {
            keys.insert(config_key_for(&job.repo_state));
        }

        let mut out = HashMap::new();
        for (repo, revision, patch) in keys {
            let result = self.task_config.read(&repo, &revision, patch.as_deref()).await;
            out.insert((repo, revision, patch), result);
        }
        out
    }

    async fn cancel_jobs(&self, job_ids: Vec<Uuid>) {
        for job_id in job_ids {
            let Some(mut job) = self.job_cache.get_by_id(job_id) else { continue };
            job.status = JobStatus::Canceled;
            if job.finished.is_none() {
                job.finished = Some(Utc::now());
            }

            let store = self.store.as_ref();
            match retry_on_concurrent_update(self.config.num_retries, {
                let job = job.clone();
                move || {
                    let job = job.clone();
                    async move { store.put_job(job).await }
                }
            })
            .await
            {
                Ok(saved) => self.job_cache.apply(vec![saved]),
                Err(err) => tracing::warn!(%err, job = %job_id, "failed to persist cancellation"),
            }
        }
    }

    /// One tick of the C10 main loop (spec.md §4.10).
    async fn run_tick(&self) -> TickReport {
        let start = Utc::now();
        let mut top_error: Option<String> = None;

        let free_bots_fut = self.list_free_bots();
        let prepare_fut = async {
            if let Err(err) = self.refresh_caches().await {
                return Err(err.to_string());
            }

            let jobs = self.job_cache.unfinished();
            let configs = self.resolve_configs(&jobs).await;
            let blacklist = self.blacklist.read().expect("blacklist lock poisoned").clone();

            let (candidates, to_cancel) = find_task_candidates_for_jobs(&jobs, self.graph.as_ref(), |job, ts_name| {
                let key = config_key_for(&job.repo_state);
                match configs.get(&key) {
                    Some(Ok(cfg)) => cfg.tasks.get(ts_name).cloned().ok_or(TaskConfigError::NotFound),
                    Some(Err(err)) => Err(err.clone()),
                    None => Err(TaskConfigError::NotFound),
                }
            });

            if !to_cancel.is_empty() {
                self.cancel_jobs(to_cancel).await;
            }

            let (accepted, rejected) = filter_task_candidates(candidates, &self.window, &self.task_cache, &blacklist);

            // This deployment doesn't maintain a per-commit task-config
            // history, so introduction-commit detection never fires;
            // recursion is bounded by MAX_BLAMELIST_COMMITS alone.
            let new_task_specs_by_state: &forge_core_services::NewTaskSpecsByState<'_> = &|_, _, _| false;
            let queue = process_task_candidates(accepted, self.graph.as_ref(), &self.task_cache, new_task_specs_by_state, &self.config);

            Ok((queue, rejected))
        };

        let (free_bots, prepared) = tokio::join!(free_bots_fut, prepare_fut);

        let (queue, rejected) = match prepared {
            Ok(pair) => pair,
            Err(err) => {
                top_error = Some(err);
                (Vec::new(), Vec::new())
            }
        };

        let (matched, unmatched) = match_bots_to_candidates(queue, &free_bots, &self.config);
        self.mark_busy(matched.iter().map(|m| m.bot_id.clone()));

        let reported = matched.clone();
        let outcome = dispatch_candidates(matched, self.store.as_ref(), self.exec.as_ref(), self.isolate.as_ref(), &self.tracker, &self.task_cache, &self.config).await;

        let triggered_by_id: HashMap<String, Uuid> =
            outcome.triggered.iter().map(|task| (candidate_id_for_task(task), task.id)).collect();
        let failed_by_id: HashMap<String, String> =
            outcome.failed.iter().map(|(id, err)| (id.clone(), err.to_string())).collect();

        let mut candidate_reports: Vec<CandidateReport> = rejected
            .into_iter()
            .map(|(candidate, reason)| CandidateReport {
                id: candidate.make_id(),
                repo: candidate.repo.clone(),
                revision: candidate.revision.clone(),
                task_name: candidate.task_name.clone(),
                score: candidate.score,
                outcome: CandidateOutcome::Filtered { reason },
            })
            .collect();

        for matched_candidate in &reported {
            let id = matched_candidate.candidate.make_id();
            let outcome = if let Some(task_id) = triggered_by_id.get(&id) {
                CandidateOutcome::Dispatched { task_id: *task_id }
            } else if let Some(error) = failed_by_id.get(&id) {
                CandidateOutcome::DispatchFailed { error: error.clone() }
            } else {
                CandidateOutcome::Matched { bot_id: matched_candidate.bot_id.clone() }
            };
            candidate_reports.push(CandidateReport {
                id,
                repo: matched_candidate.candidate.repo.clone(),
                revision: matched_candidate.candidate.revision.clone(),
                task_name: matched_candidate.candidate.task_name.clone(),
                score: matched_candidate.candidate.score,
                outcome,
            });
        }

        for candidate in unmatched {
            candidate_reports.push(CandidateReport {
                id: candidate.make_id(),
                repo: candidate.repo.clone(),
                revision: candidate.revision.clone(),
                task_name: candidate.task_name.clone(),
                score: candidate.score,
                outcome: CandidateOutcome::Queued,
            });
        }

        candidate_reports.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let report = TickReport {
            start,
            end: Utc::now(),
            candidates: candidate_reports,
            free_bots,
            error: top_error,
        };

        *self.last_tick.write().expect("last tick lock poisoned") = Some(report.clone());

        let diagnostics = Arc::clone(&self.diagnostics);
        let timeout = Duration::from_secs(self.config.diagnostics_write_timeout_secs);
        let to_write = report.clone();
        match tokio::time::timeout(timeout, async move { diagnostics.write(&to_write).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(%err, "diagnostics write failed"),
            Err(_) => tracing::warn!("diagnostics write timed out"),
        }

        report
    }

    /// Spawns the main loop plus every independent periodic task
    /// (spec.md §5): each loop body runs sequentially to completion
    /// before its own next iteration, so none is reentrant with itself,
    /// and the five loops never block one another.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push({
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(this.config.main_loop_period_secs));
                loop {
                    interval.tick().await;
                    this.tick().await;
                }
            })
        });

        handles.push({
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(this.config.repo_update_period_secs));
                loop {
                    interval.tick().await;
                    for repo in &this.repos {
                        if let Err(err) = this.graph.update(repo) {
                            tracing::warn!(%err, repo, "periodic repo update failed");
                        }
                    }
                }
            })
        });

        handles.push({
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(this.config.completion_poll_period_secs));
                loop {
                    interval.tick().await;
                    let unfinished = this.task_cache.unfinished();
                    match this.tracker.poll(this.store.as_ref(), this.exec.as_ref(), &unfinished).await {
                        Ok(updated) => this.task_cache.apply(updated),
                        Err(err) => tracing::warn!(%err, "completion poll failed"),
                    }
                }
            })
        });

        handles.push({
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(this.config.try_job_poll_period_secs));
                loop {
                    interval.tick().await;
                    let integrator = TryJobIntegrator::new(this.review.as_ref());
                    let job_cache = &this.job_cache;
                    let existing_job_for = |repo_state: &RepoState, name: &str| {
                        job_cache.triggered_for_commit(&repo_state.repo, &repo_state.revision).iter().any(|job| job.name == name)
                    };
                    match integrator.poll(this.store.as_ref(), existing_job_for).await {
                        Ok(jobs) => this.job_cache.apply(jobs),
                        Err(err) => tracing::warn!(%err, "try-job poll failed"),
                    }
                }
            })
        });

        handles.push({
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(this.config.try_job_heartbeat_period_secs));
                loop {
                    interval.tick().await;
                    let integrator = TryJobIntegrator::new(this.review.as_ref());
                    let active: Vec<Job> = this.job_cache.unfinished().into_iter().filter(|job| job.buildbucket_lease_key.is_some()).collect();
                    let failed = integrator.heartbeat(&active).await;
                    if failed.is_empty() {
                        continue;
                    }
                    tracing::warn!(count = failed.len(), "try-job heartbeat failures, cancelling locally");
                    this.cancel_jobs(failed).await;
                }
            })
        });

        handles
    }
}

#[async_trait]
impl Deployment for LocalDeployment {
    async fn tick(&self) -> TickReport {
        let _guard = self.tick_lock.lock().await;
        self.run_tick().await
    }

    fn last_tick(&self) -> Option<TickReport> {
        self.last_tick.read().expect("last tick lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use forge_core_db::{models::job::JobStatus, InMemoryStore};
    use forge_core_executors::{
        BotInfo, Commit, FakeExecutionService, FakeReviewServiceClient, FakeTaskConfigReader, InMemoryIsolateClient, InMemoryRepoGraph,
        TaskSpec, TasksCfg,
    };

    use super::*;
    use crate::diagnostics::FilesystemDiagnosticsSink;

    fn deployment(graph: Arc<InMemoryRepoGraph>, exec: Arc<FakeExecutionService>, data_dir: &std::path::Path) -> Arc<LocalDeployment> {
        let config = FakeTaskConfigReader::default();
        config.set(TasksCfg {
            tasks: HashMap::from([(
                "Build".to_string(),
                TaskSpec { name: "Build".into(), dimensions: vec!["os:linux".into()], max_attempts: 1, ..Default::default() },
            )]),
            jobs: HashMap::new(),
        });

        Arc::new(LocalDeployment::new(
            Arc::new(InMemoryStore::new()),
            graph,
            exec,
            Arc::new(InMemoryIsolateClient::new()),
            Arc::new(FakeReviewServiceClient::new()),
            Arc::new(config),
            Arc::new(FilesystemDiagnosticsSink::new(data_dir)),
            SchedulerConfig::default(),
            vec!["repo".to_string()],
            vec![vec!["os:linux".to_string()]],
        ))
    }

    #[tokio::test]
    async fn tick_dispatches_a_ready_job_to_a_free_bot() {
        let graph = Arc::new(InMemoryRepoGraph::new());
        graph.insert_commit("repo", Commit { hash: "rev".into(), parents: vec![], timestamp: Utc::now(), on_main: true });
        graph.set_main_tip("repo", "rev");

        let exec = Arc::new(FakeExecutionService::new());
        exec.add_bot(BotInfo { bot_id: "bot-1".into(), dimensions: vec!["os:linux".into()] });

        let tmp = tempfile::tempdir().expect("tempdir");
        let deployment = deployment(graph, Arc::clone(&exec), tmp.path());

        let job = Job {
            id: Uuid::new_v4(),
            name: "ci".into(),
            repo_state: RepoState::new("repo", "rev"),
            created: Utc::now(),
            finished: None,
            status: JobStatus::InProgress,
            is_force: false,
            dependencies: HashMap::from([("Build".to_string(), vec![])]),
            tasks: HashMap::new(),
            priority: 0.5,
            buildbucket_build_id: None,
            buildbucket_lease_key: None,
            db_modified: 0,
        };
        deployment.store.put_job(job).await.expect("seed job");

        let report = deployment.tick().await;

        assert!(report.error.is_none());
        assert_eq!(report.free_bots.len(), 1, "the bot was free at the start of the tick");
        assert!(report.candidates.iter().any(|c| matches!(c.outcome, CandidateOutcome::Dispatched { .. })), "{:?}", report.candidates);
        assert_eq!(deployment.last_tick().map(|t| t.start), Some(report.start));
    }

    #[tokio::test]
    async fn tick_with_no_free_bots_leaves_candidate_queued() {
        let graph = Arc::new(InMemoryRepoGraph::new());
        graph.insert_commit("repo", Commit { hash: "rev".into(), parents: vec![], timestamp: Utc::now(), on_main: true });
        graph.set_main_tip("repo", "rev");

        let exec = Arc::new(FakeExecutionService::new());
        let tmp = tempfile::tempdir().expect("tempdir");
        let deployment = deployment(graph, exec, tmp.path());

        let job = Job {
            id: Uuid::new_v4(),
            name: "ci".into(),
            repo_state: RepoState::new("repo", "rev"),
            created: Utc::now(),
            finished: None,
            status: JobStatus::InProgress,
            is_force: false,
            dependencies: HashMap::from([("Build".to_string(), vec![])]),
            tasks: HashMap::new(),
            priority: 0.5,
            buildbucket_build_id: None,
            buildbucket_lease_key: None,
            db_modified: 0,
        };
        deployment.store.put_job(job).await.expect("seed job");

        let report = deployment.tick().await;

        assert!(report.free_bots.is_empty());
        assert!(report.candidates.iter().any(|c| matches!(c.outcome, CandidateOutcome::Queued)), "{:?}", report.candidates);
    }
}
