use std::collections::HashMap;

use forge_core_executors::RepoGraph;

use crate::task_cache::TaskCache;

pub const MAX_BLAMELIST_COMMITS: usize = 500;

/// The task a newly-scheduled task is taking commits from, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealingFrom {
    pub task_id: uuid::Uuid,
    pub revision: String,
}

/// Result of computing a blamelist for one (repo, taskName, revision)
/// (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct BlamelistResult {
    pub commits: Vec<String>,
    pub stealing_from: Option<StealingFrom>,
    /// True iff `MAX_BLAMELIST_COMMITS` was hit and `commits` was reset
    /// to just the starting revision as a safety cap.
    pub capped: bool,
}

impl BlamelistResult {
    pub fn is_retry(&self, revision: &str) -> bool {
        self.stealing_from.as_ref().is_some_and(|s| s.revision == revision)
    }
}

/// `newTaskSpecsByState[(repo, commit)][taskName]`: true when `taskName`
/// was freshly introduced into the task config at that commit, which
/// bounds how far back a blamelist can recurse (spec.md §4.6 step 6).
pub type NewTaskSpecsByState<'a> = dyn Fn(&str, &str, &str) -> bool + 'a;

/// Computes blamelists by walking parent history and consulting the
/// task cache for prior coverage of the same task-spec (spec.md §4.6).
pub struct BlamelistEngine<'a> {
    graph: &'a dyn RepoGraph,
    task_cache: &'a TaskCache,
}

impl<'a> BlamelistEngine<'a> {
    pub fn new(graph: &'a dyn RepoGraph, task_cache: &'a TaskCache) -> Self {
        Self { graph, task_cache }
    }

    pub fn compute(
        &self,
        task_name: &str,
        repo: &str,
        revision: &str,
        new_task_specs_by_state: &NewTaskSpecsByState<'_>,
    ) -> BlamelistResult {
        let mut commits = Vec::new();
        let mut stealing_from: Option<StealingFrom> = None;
        let mut capped = false;

        let mut frontier = vec![revision.to_string()];
        let mut visited = std::collections::HashSet::new();

        'walk: while let Some(hash) = frontier.pop() {
            if !visited.insert(hash.clone()) {
                continue;
            }
            let Some(commit) = self.graph.get(repo, &hash) else {
                continue;
            };

            let prev = self.task_cache.get_task_for_commit(repo, &commit.hash, task_name);

            if commits.len() >= MAX_BLAMELIST_COMMITS {
                commits = vec![revision.to_string()];
                capped = true;
                break 'walk;
            }

            if prev.is_none() && stealing_from.is_some() {
                continue;
            }

            if let Some(prev_task) = &prev {
                if commits.is_empty() {
                    stealing_from = Some(StealingFrom {
                        task_id: prev_task.id,
                        revision: prev_task.revision().to_string(),
                    });
                    if prev_task.revision() == revision {
                        commits = prev_task.commits.clone();
                        break 'walk;
                    }
                } else if stealing_from.as_ref().map(|s| s.task_id) != Some(prev_task.id) {
                    continue;
                }
            }

            commits.push(commit.hash.clone());

            if new_task_specs_by_state(repo, &commit.hash, task_name) {
                break 'walk;
            }

            for parent in &commit.parents {
                frontier.push(parent.clone());
            }
        }

        BlamelistResult { commits, stealing_from, capped }
    }
}

/// `StealingFrom.Commits \ newTask.Commits`, re-persisted alongside the
/// new task in the same transaction so no commit is claimed twice
/// (spec.md §4.6).
pub fn complement(stolen_from_commits: &[String], new_task_commits: &[String]) -> Vec<String> {
    stolen_from_commits
        .iter()
        .filter(|c| !new_task_commits.contains(c))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use forge_core_db::models::{
        repo_state::RepoState,
        task::{Task, TaskKey, TaskStatus},
    };
    use forge_core_executors::{Commit, InMemoryRepoGraph};
    use uuid::Uuid;

    use super::*;

    fn commit(hash: &str, parents: &[&str]) -> Commit {
        Commit { hash: hash.to_string(), parents: parents.iter().map(|s| s.to_string()).collect(), timestamp: Utc::now(), on_main: true }
    }

    fn linear_chain() -> InMemoryRepoGraph {
        let graph = InMemoryRepoGraph::new();
        graph.insert_commit("repo", commit("c1", &[]));
        graph.insert_commit("repo", commit("c2", &["c1"]));
        graph.insert_commit("repo", commit("c3", &["c2"]));
        graph
    }

    fn prior_task(repo: &str, revision: &str, commits: Vec<&str>) -> Task {
        Task {
            id: Uuid::new_v4(),
            key: TaskKey::new(RepoState::new(repo, revision), "Build"),
            attempt: 0,
            status: TaskStatus::Success,
            retry_of: None,
            commits: commits.into_iter().map(str::to_string).collect(),
            jobs: vec![],
            parent_task_ids: vec![],
            isolated_input: None,
            isolated_output: None,
            created: Utc::now(),
            started: None,
            finished: None,
            swarming_task_id: None,
            max_attempts: 2,
            db_modified: 1,
        }
    }

    #[test]
    fn new_ground_when_nothing_scheduled_before() {
        let graph = linear_chain();
        let cache = TaskCache::new();
        let engine = BlamelistEngine::new(&graph, &cache);
        let result = engine.compute("Build", "repo", "c3", &|_, _, _| false);
        assert_eq!(result.commits, vec!["c3", "c2", "c1"]);
        assert!(result.stealing_from.is_none());
        assert!(!result.capped);
    }

    #[test]
    fn retry_copies_prior_blamelist_verbatim() {
        let graph = linear_chain();
        let cache = TaskCache::new();
        cache.apply(vec![prior_task("repo", "c3", vec!["c3", "c2", "c1"])]);

        let engine = BlamelistEngine::new(&graph, &cache);
        let result = engine.compute("Build", "repo", "c3", &|_, _, _| false);
        assert_eq!(result.commits, vec!["c3", "c2", "c1"]);
        assert!(result.is_retry("c3"));
    }

    #[test]
    fn bisect_steals_partial_range_from_ancestor_task() {
        // Spec scenario S3: after a task ran at c3 covering [c3,c2,c1],
        // scheduling the same spec at c2 bisects it: the new task takes
        // [c2,c1] and the old task's complement becomes [c3].
        let graph = linear_chain();
        let cache = TaskCache::new();
        let prior = prior_task("repo", "c3", vec!["c3", "c2", "c1"]);
        let prior_id = prior.id;
        cache.apply(vec![prior]);

        let engine = BlamelistEngine::new(&graph, &cache);
        let result = engine.compute("Build", "repo", "c2", &|_, _, _| false);
        assert_eq!(result.commits, vec!["c2", "c1"]);
        assert!(!result.is_retry("c2"));
        assert_eq!(result.stealing_from.as_ref().map(|s| s.task_id), Some(prior_id));

        let remaining = complement(&vec!["c3".to_string(), "c2".to_string(), "c1".to_string()], &result.commits);
        assert_eq!(remaining, vec!["c3".to_string()]);
    }

    #[test]
    fn introduction_commit_stops_recursion() {
        let graph = linear_chain();
        let cache = TaskCache::new();
        let engine = BlamelistEngine::new(&graph, &cache);
        let result = engine.compute("Build", "repo", "c3", &|_, hash, _| hash == "c2");
        assert_eq!(result.commits, vec!["c3", "c2"]);
    }

    #[test]
    fn complement_removes_commits_claimed_by_new_task() {
        let stolen = vec!["c3".to_string(), "c2".to_string(), "c1".to_string()];
        let new_task = vec!["c2".to_string(), "c1".to_string()];
        assert_eq!(complement(&stolen, &new_task), vec!["c3".to_string()]);
    }
}
