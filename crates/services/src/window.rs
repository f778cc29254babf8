use std::{collections::HashMap, sync::RwLock};

use chrono::{DateTime, Duration, Utc};
use forge_core_executors::RepoGraph;

/// Per-repo in-window state (spec.md §3/§4.3): the earliest timestamp a
/// commit or task must have to be considered relevant, and the set of
/// commit hashes kept in-window purely by commit-count even though
/// they're older than `start`.
#[derive(Debug, Clone, Default)]
struct RepoWindow {
    start: Option<DateTime<Utc>>,
    commit_floor: std::collections::HashSet<String>,
}

/// Bounds what's "relevant" to the scheduler: a time horizon plus a
/// minimum commit count per repo, recomputed every tick (spec.md §4.3).
pub struct Window {
    period: Duration,
    num_commits: usize,
    repos: RwLock<HashMap<String, RepoWindow>>,
}

impl Window {
    pub fn new(period: Duration, num_commits: usize) -> Self {
        Self {
            period,
            num_commits,
            repos: RwLock::new(HashMap::new()),
        }
    }

    /// Recomputes the window for `repo`: the start timestamp is
    /// `now - period`, widened (never narrowed) so that at least
    /// `num_commits` commits on main remain in-window.
    pub fn update(&self, repo: &str, graph: &dyn RepoGraph) {
        let now = Utc::now();
        let mut start = now - self.period;

        let latest = graph.latest_main_commits(repo, self.num_commits);
        let mut commit_floor = std::collections::HashSet::new();
        if let Some(oldest_of_floor) = latest.last() {
            if oldest_of_floor.timestamp < start {
                start = oldest_of_floor.timestamp;
            }
        }
        for commit in &latest {
            commit_floor.insert(commit.hash.clone());
        }

        self.repos.write().expect("window lock poisoned").insert(
            repo.to_string(),
            RepoWindow { start: Some(start), commit_floor },
        );
    }

    /// A timestamp is in-window iff it is on/after the repo's start.
    /// Repos never `update`d are treated as having no window (nothing
    /// is in-window) so callers don't silently accept stale data.
    pub fn test_time(&self, repo: &str, t: DateTime<Utc>) -> bool {
        match self.repos.read().expect("window lock poisoned").get(repo) {
            Some(window) => window.start.is_some_and(|start| t >= start),
            None => false,
        }
    }

    /// A commit is in-window iff it's one of the latest `num_commits` on
    /// main, regardless of age.
    pub fn test_commit(&self, repo: &str, commit: &str) -> bool {
        self.repos
            .read()
            .expect("window lock poisoned")
            .get(repo)
            .is_some_and(|window| window.commit_floor.contains(commit))
    }

    /// The repo's current window start, for range-querying the store
    /// when refreshing the caches (spec.md §4.10 step 2). `None` for a
    /// repo never `update`d.
    pub fn start(&self, repo: &str) -> Option<DateTime<Utc>> {
        self.repos.read().expect("window lock poisoned").get(repo).and_then(|window| window.start)
    }
}

#[cfg(test)]
mod tests {
    use forge_core_executors::{Commit, InMemoryRepoGraph};

    use super::*;

    fn commit(hash: &str, parents: &[&str], hours_ago: i64) -> Commit {
        Commit {
            hash: hash.to_string(),
            parents: parents.iter().map(|s| s.to_string()).collect(),
            timestamp: Utc::now() - Duration::hours(hours_ago),
            on_main: true,
        }
    }

    #[test]
    fn window_widens_to_cover_minimum_commit_count() {
        let graph = InMemoryRepoGraph::new();
        graph.insert_commit("repo", commit("c1", &[], 1000));
        graph.insert_commit("repo", commit("c2", &["c1"], 500));
        graph.insert_commit("repo", commit("c3", &["c2"], 1));
        graph.set_main_tip("repo", "c3");

        let window = Window::new(Duration::hours(1), 3);
        window.update("repo", &graph);

        // c1 is ~1000h old, far outside a 1h period, but is one of the
        // latest 3 commits so must remain in-window by commit count.
        assert!(window.test_commit("repo", "c1"));
        assert!(window.test_time("repo", commit("c1", &[], 1000).timestamp));
    }

    #[test]
    fn unknown_repo_is_never_in_window() {
        let window = Window::new(Duration::hours(1), 3);
        assert!(!window.test_time("ghost", Utc::now()));
        assert!(!window.test_commit("ghost", "deadbeef"));
    }

    #[test]
    fn recent_commit_outside_floor_is_in_window_by_time() {
        let graph = InMemoryRepoGraph::new();
        graph.insert_commit("repo", commit("c1", &[], 1));
        graph.set_main_tip("repo", "c1");

        let window = Window::new(Duration::hours(24), 1);
        window.update("repo", &graph);
        assert!(window.test_time("repo", Utc::now()));
    }
}
