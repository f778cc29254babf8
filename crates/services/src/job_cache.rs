use std::collections::HashMap;

use chrono::{DateTime, Utc};
use forge_core_db::models::job::Job;
use uuid::Uuid;

/// Job cache, analogous to `TaskCache` (spec.md §4.5): indexed by id,
/// by `(repo, revision) -> job ids` for "already triggered at this
/// commit" lookups, and by unfinished status.
#[derive(Default)]
pub struct JobCache {
    inner: std::sync::RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    triggered_for_commit: HashMap<String, HashMap<String, Vec<Uuid>>>,
    unfinished: HashMap<Uuid, Uuid>,
    jobs_by_time: Vec<Uuid>,
}

impl JobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, jobs: Vec<Job>) {
        let mut inner = self.inner.write().expect("job cache lock poisoned");
        for job in jobs {
            inner.apply_one(job);
        }
    }

    pub fn expire_and_update(&self, window_start_by_repo: &HashMap<String, DateTime<Utc>>, jobs: Vec<Job>) {
        let mut inner = self.inner.write().expect("job cache lock poisoned");
        inner.expire(window_start_by_repo);
        for job in jobs {
            inner.apply_one(job);
        }
    }

    pub fn reset(&self, jobs: Vec<Job>) {
        let mut inner = self.inner.write().expect("job cache lock poisoned");
        *inner = Inner::default();
        for job in jobs {
            inner.apply_one(job);
        }
    }

    pub fn get_by_id(&self, id: Uuid) -> Option<Job> {
        self.inner.read().expect("job cache lock poisoned").jobs.get(&id).cloned()
    }

    pub fn triggered_for_commit(&self, repo: &str, revision: &str) -> Vec<Job> {
        let inner = self.inner.read().expect("job cache lock poisoned");
        inner
            .triggered_for_commit
            .get(repo)
            .and_then(|by_rev| by_rev.get(revision))
            .map(|ids| ids.iter().filter_map(|id| inner.jobs.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn unfinished(&self) -> Vec<Job> {
        let inner = self.inner.read().expect("job cache lock poisoned");
        inner.unfinished.values().filter_map(|id| inner.jobs.get(id).cloned()).collect()
    }

    pub fn from_date_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Job> {
        let inner = self.inner.read().expect("job cache lock poisoned");
        inner
            .jobs_by_time
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| job.created >= from && job.created < to)
            .cloned()
            .collect()
    }
}

impl Inner {
    fn expire(&mut self, window_start_by_repo: &HashMap<String, DateTime<Utc>>) {
        let expired: Vec<Uuid> = self
            .jobs
            .values()
            .filter(|job| {
                window_start_by_repo
                    .get(&job.repo_state.repo)
                    .is_some_and(|start| job.created < *start)
            })
            .map(|job| job.id)
            .collect();
        for id in expired {
            self.remove(id);
        }
    }

    fn remove(&mut self, id: Uuid) {
        let Some(job) = self.jobs.remove(&id) else { return };
        self.jobs_by_time.retain(|existing| *existing != id);
        self.unfinished.remove(&id);
        if let Some(by_rev) = self.triggered_for_commit.get_mut(&job.repo_state.repo) {
            if let Some(ids) = by_rev.get_mut(&job.repo_state.revision) {
                ids.retain(|existing| *existing != id);
            }
        }
    }

    fn apply_one(&mut self, job: Job) {
        let id = job.id;
        self.remove(id);

        self.jobs_by_time.push(id);
        if job.status.is_done() {
            self.unfinished.remove(&id);
        } else {
            self.unfinished.insert(id, id);
        }
        self.triggered_for_commit
            .entry(job.repo_state.repo.clone())
            .or_default()
            .entry(job.repo_state.revision.clone())
            .or_default()
            .push(id);

        self.jobs.insert(id, job);
        self.jobs_by_time.sort_by_key(|id| self.jobs.get(id).map(|j| j.created).unwrap_or_default());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as Map;

    use forge_core_db::models::{job::JobStatus, repo_state::RepoState};

    use super::*;

    fn job(repo: &str, rev: &str, status: JobStatus, created_secs: i64) -> Job {
        Job {
            id: Uuid::new_v4(),
            name: "ci".into(),
            repo_state: RepoState::new(repo, rev),
            created: Utc::now() + chrono::Duration::seconds(created_secs),
            finished: None,
            status,
            is_force: false,
            dependencies: Map::new(),
            tasks: Map::new(),
            priority: 0.5,
            buildbucket_build_id: None,
            buildbucket_lease_key: None,
            db_modified: 1,
        }
    }

    #[test]
    fn triggered_for_commit_finds_jobs_at_revision() {
        let cache = JobCache::new();
        let j = job("repo", "rev1", JobStatus::InProgress, 0);
        let id = j.id;
        cache.apply(vec![j]);
        let found = cache.triggered_for_commit("repo", "rev1");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
    }

    #[test]
    fn unfinished_excludes_done_jobs() {
        let cache = JobCache::new();
        cache.apply(vec![
            job("repo", "rev1", JobStatus::InProgress, 0),
            job("repo", "rev2", JobStatus::Success, 1),
        ]);
        assert_eq!(cache.unfinished().len(), 1);
    }

    #[test]
    fn expire_and_update_drops_stale_jobs() {
        let cache = JobCache::new();
        cache.apply(vec![job("repo", "rev1", JobStatus::Success, -1000)]);

        let mut starts = Map::new();
        starts.insert("repo".to_string(), Utc::now() - chrono::Duration::seconds(10));
        cache.expire_and_update(&starts, vec![]);

        assert!(cache.triggered_for_commit("repo", "rev1").is_empty());
    }
}
