use std::collections::HashMap;

use chrono::{DateTime, Utc};
use forge_core_db::models::task::{Task, TaskKey};
use uuid::Uuid;

/// Shared, read-only-to-readers snapshot of recently-touched tasks
/// (spec.md §4.5). Readers take a shared lock; writers (`apply`,
/// `expire_and_update`) take an exclusive one — modeled here with a
/// `std::sync::RwLock` since the cache is refreshed from a single tick
/// loop and read from many concurrent scoring workers.
#[derive(Default)]
pub struct TaskCache {
    inner: std::sync::RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    tasks_by_key: HashMap<TaskKey, Vec<Uuid>>,
    /// `tasksByCommit[repo][commit][taskName] -> Task`. At most one task
    /// per (repo, commit, name); callers must `remove_from_commit_index`
    /// the superseded task before inserting the new one (spec.md §4.6).
    tasks_by_commit: HashMap<String, HashMap<String, HashMap<String, Uuid>>>,
    tasks_by_time: Vec<Uuid>,
    unfinished: HashMap<Uuid, Uuid>,
    /// `knownTaskNames[repo][name] -> latestCreated`, populated only from
    /// tasks that are neither force-run nor try-jobs.
    known_task_names: HashMap<String, HashMap<String, DateTime<Utc>>>,
}

impl TaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a batch of newly-modified tasks, as if freshly pulled
    /// from C4 (spec.md §4.5 `Update()`). Superseded commit-index
    /// entries are replaced, not merged.
    pub fn apply(&self, tasks: Vec<Task>) {
        let mut inner = self.inner.write().expect("task cache lock poisoned");
        for task in tasks {
            inner.apply_one(task);
        }
    }

    /// `ExpireAndUpdate`: drops entries whose `Created` falls before
    /// `window_start_by_repo`, then applies the freshly pulled set.
    pub fn expire_and_update(
        &self,
        window_start_by_repo: &HashMap<String, DateTime<Utc>>,
        tasks: Vec<Task>,
    ) {
        let mut inner = self.inner.write().expect("task cache lock poisoned");
        inner.expire(window_start_by_repo);
        for task in tasks {
            inner.apply_one(task);
        }
    }

    /// Discards everything and reloads from a full range query, as
    /// happens on an "unknown tracker" condition (spec.md §4.5).
    pub fn reset(&self, tasks: Vec<Task>) {
        let mut inner = self.inner.write().expect("task cache lock poisoned");
        *inner = Inner::default();
        for task in tasks {
            inner.apply_one(task);
        }
    }

    pub fn get_by_id(&self, id: Uuid) -> Option<Task> {
        self.inner.read().expect("task cache lock poisoned").tasks.get(&id).cloned()
    }

    pub fn get_by_key(&self, key: &TaskKey) -> Vec<Task> {
        let inner = self.inner.read().expect("task cache lock poisoned");
        inner
            .tasks_by_key
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| inner.tasks.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// `taskCache.GetTaskForCommit` (spec.md §4.6 step 1).
    pub fn get_task_for_commit(&self, repo: &str, commit: &str, task_name: &str) -> Option<Task> {
        let inner = self.inner.read().expect("task cache lock poisoned");
        inner
            .tasks_by_commit
            .get(repo)
            .and_then(|by_commit| by_commit.get(commit))
            .and_then(|by_name| by_name.get(task_name))
            .and_then(|id| inner.tasks.get(id).cloned())
    }

    pub fn unfinished(&self) -> Vec<Task> {
        let inner = self.inner.read().expect("task cache lock poisoned");
        inner.unfinished.values().filter_map(|id| inner.tasks.get(id).cloned()).collect()
    }

    pub fn from_date_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Task> {
        let inner = self.inner.read().expect("task cache lock poisoned");
        inner
            .tasks_by_time
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .filter(|task| task.created >= from && task.created < to)
            .cloned()
            .collect()
    }

    pub fn known_task_names(&self, repo: &str) -> Vec<String> {
        self.inner
            .read()
            .expect("task cache lock poisoned")
            .known_task_names
            .get(repo)
            .map(|names| names.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Inner {
    fn expire(&mut self, window_start_by_repo: &HashMap<String, DateTime<Utc>>) {
        let expired: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|task| {
                window_start_by_repo
                    .get(&task.key.repo_state.repo)
                    .is_some_and(|start| task.created < *start)
            })
            .map(|task| task.id)
            .collect();
        for id in expired {
            self.remove(id);
        }
    }

    fn remove(&mut self, id: Uuid) {
        let Some(task) = self.tasks.remove(&id) else { return };
        if let Some(ids) = self.tasks_by_key.get_mut(&task.key) {
            ids.retain(|existing| *existing != id);
        }
        self.tasks_by_time.retain(|existing| *existing != id);
        self.unfinished.remove(&id);
        for commit in &task.commits {
            if let Some(by_commit) = self.tasks_by_commit.get_mut(&task.key.repo_state.repo) {
                if let Some(by_name) = by_commit.get_mut(commit) {
                    if by_name.get(&task.key.name) == Some(&id) {
                        by_name.remove(&task.key.name);
                    }
                }
            }
        }
    }

    fn apply_one(&mut self, task: Task) {
        let id = task.id;
        self.remove(id);

        self.tasks_by_key.entry(task.key.clone()).or_default().push(id);
        self.tasks_by_time.push(id);

        if task.status.is_done() {
            self.unfinished.remove(&id);
        } else {
            self.unfinished.insert(id, id);
        }

        for commit in &task.commits {
            self.tasks_by_commit
                .entry(task.key.repo_state.repo.clone())
                .or_default()
                .entry(commit.clone())
                .or_default()
                .insert(task.key.name.clone(), id);
        }

        let is_forced_or_try = task.key.forced_job_id.is_some() || task.key.repo_state.is_try_job();
        if !is_forced_or_try {
            let entry = self
                .known_task_names
                .entry(task.key.repo_state.repo.clone())
                .or_default()
                .entry(task.key.name.clone())
                .or_insert(task.created);
            if task.created > *entry {
                *entry = task.created;
            }
        }

        self.tasks.insert(id, task);
        self.tasks_by_time.sort_by_key(|id| self.tasks.get(id).map(|t| t.created).unwrap_or_default());
    }
}

#[cfg(test)]
mod tests {
    use forge_core_db::models::{repo_state::RepoState, task::TaskStatus};

    use super::*;

    fn task(repo: &str, name: &str, created_secs: i64, status: TaskStatus, commits: Vec<&str>) -> Task {
        Task {
            id: Uuid::new_v4(),
            key: TaskKey::new(RepoState::new(repo, commits.last().copied().unwrap_or("rev")), name),
            attempt: 0,
            status,
            retry_of: None,
            commits: commits.into_iter().map(str::to_string).collect(),
            jobs: vec![],
            parent_task_ids: vec![],
            isolated_input: None,
            isolated_output: None,
            created: Utc::now() + chrono::Duration::seconds(created_secs),
            started: None,
            finished: None,
            swarming_task_id: None,
            max_attempts: 2,
            db_modified: 1,
        }
    }

    #[test]
    fn get_task_for_commit_resolves_by_repo_commit_and_name() {
        let cache = TaskCache::new();
        let t = task("repo", "Build", 0, TaskStatus::Success, vec!["c1"]);
        let id = t.id;
        cache.apply(vec![t]);
        let found = cache.get_task_for_commit("repo", "c1", "Build").expect("found");
        assert_eq!(found.id, id);
    }

    #[test]
    fn unfinished_excludes_done_tasks() {
        let cache = TaskCache::new();
        cache.apply(vec![
            task("repo", "Build", 0, TaskStatus::Running, vec!["c1"]),
            task("repo", "Test", 1, TaskStatus::Success, vec!["c1"]),
        ]);
        let unfinished = cache.unfinished();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].key.name, "Build");
    }

    #[test]
    fn expire_and_update_drops_stale_entries() {
        let cache = TaskCache::new();
        let old = task("repo", "Build", -1000, TaskStatus::Success, vec!["c1"]);
        cache.apply(vec![old]);

        let mut starts = HashMap::new();
        starts.insert("repo".to_string(), Utc::now() - chrono::Duration::seconds(10));
        cache.expire_and_update(&starts, vec![]);

        assert!(cache.get_task_for_commit("repo", "c1", "Build").is_none());
    }

    #[test]
    fn known_task_names_excludes_try_jobs() {
        let cache = TaskCache::new();
        let mut try_job_task = task("repo", "Presubmit", 0, TaskStatus::Success, vec!["c1"]);
        try_job_task.key.repo_state.patch = Some(forge_core_db::models::repo_state::Patch {
            server: "review".into(),
            issue: 1,
            patchset: 1,
            patch_repo: None,
        });
        cache.apply(vec![try_job_task, task("repo", "Build", 1, TaskStatus::Success, vec!["c2"])]);

        let names = cache.known_task_names("repo");
        assert!(names.contains(&"Build".to_string()));
        assert!(!names.contains(&"Presubmit".to_string()));
    }
}
