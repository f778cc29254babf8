use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoGraphError {
    #[error("unknown repo: {0}")]
    UnknownRepo(String),
}

/// One commit in a repo's in-process DAG (spec.md §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub hash: String,
    pub parents: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// True if this commit is reachable from the repo's main branch tip,
    /// used by the Window (spec.md §4.3) to bound "latest N commits".
    pub on_main: bool,
}

/// Sentinel returned by the visitor passed to `recurse_all_branches` to
/// stop recursion down the current parent chain without visiting its
/// ancestors (spec.md §4.1).
pub enum Recurse {
    Continue,
    StopBranch,
}

/// Mirrors one or more source repositories; answers ancestry,
/// recurse-branches, and commit-by-hash queries (spec.md §4.1). Ancestry
/// and recursion are deterministic given the same repo contents so
/// blamelist computation is reproducible.
pub trait RepoGraph: Send + Sync {
    fn update(&self, repo: &str) -> Result<(), RepoGraphError>;
    fn get(&self, repo: &str, hash: &str) -> Option<Commit>;
    fn is_ancestor(&self, repo: &str, ancestor: &str, descendant: &str) -> bool;

    /// Visits each commit in the repo once, in deterministic order
    /// (topological, parents after children). `visit` can return
    /// `Recurse::StopBranch` to avoid descending further down the
    /// current parent chain.
    fn recurse_all_branches(
        &self,
        repo: &str,
        start: &str,
        visit: &mut dyn FnMut(&Commit) -> Recurse,
    );

    /// Latest `n` commits reachable from `repo`'s main branch, newest first.
    fn latest_main_commits(&self, repo: &str, n: usize) -> Vec<Commit>;
}

/// In-memory DAG-backed `RepoGraph`. `update` is a no-op hook real
/// deployments would wire to an actual git fetch; tests and the
/// in-process mirror both operate purely on the DAG kept here.
#[derive(Default)]
pub struct InMemoryRepoGraph {
    repos: RwLock<HashMap<String, HashMap<String, Commit>>>,
    main_tips: RwLock<HashMap<String, String>>,
}

impl InMemoryRepoGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Test/fixture helper: register a commit directly into the DAG.
    pub fn insert_commit(&self, repo: &str, commit: Commit) {
        let mut repos = self.repos.write().expect("repo graph lock poisoned");
        repos
            .entry(repo.to_string())
            .or_default()
            .insert(commit.hash.clone(), commit);
    }

    pub fn set_main_tip(&self, repo: &str, hash: &str) {
        self.main_tips
            .write()
            .expect("repo graph lock poisoned")
            .insert(repo.to_string(), hash.to_string());
    }
}

impl RepoGraph for InMemoryRepoGraph {
    fn update(&self, _repo: &str) -> Result<(), RepoGraphError> {
        Ok(())
    }

    fn get(&self, repo: &str, hash: &str) -> Option<Commit> {
        self.repos
            .read()
            .expect("repo graph lock poisoned")
            .get(repo)
            .and_then(|commits| commits.get(hash))
            .cloned()
    }

    fn is_ancestor(&self, repo: &str, ancestor: &str, descendant: &str) -> bool {
        if ancestor == descendant {
            return true;
        }
        let mut frontier = vec![descendant.to_string()];
        let mut seen = std::collections::HashSet::new();
        while let Some(hash) = frontier.pop() {
            if !seen.insert(hash.clone()) {
                continue;
            }
            let Some(commit) = self.get(repo, &hash) else {
                continue;
            };
            for parent in &commit.parents {
                if parent == ancestor {
                    return true;
                }
                frontier.push(parent.clone());
            }
        }
        false
    }

    fn recurse_all_branches(
        &self,
        repo: &str,
        start: &str,
        visit: &mut dyn FnMut(&Commit) -> Recurse,
    ) {
        let mut visited = std::collections::HashSet::new();
        let mut stack = vec![start.to_string()];
        while let Some(hash) = stack.pop() {
            if !visited.insert(hash.clone()) {
                continue;
            }
            let Some(commit) = self.get(repo, &hash) else {
                continue;
            };
            if let Recurse::StopBranch = visit(&commit) {
                continue;
            }
            for parent in &commit.parents {
                stack.push(parent.clone());
            }
        }
    }

    fn latest_main_commits(&self, repo: &str, n: usize) -> Vec<Commit> {
        let Some(tip) = self
            .main_tips
            .read()
            .expect("repo graph lock poisoned")
            .get(repo)
            .cloned()
        else {
            return Vec::new();
        };

        let mut out = Vec::new();
        self.recurse_all_branches(repo, &tip, &mut |commit| {
            if out.len() < n {
                out.push(commit.clone());
                Recurse::Continue
            } else {
                Recurse::StopBranch
            }
        });
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(n);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(hash: &str, parents: &[&str], hours_ago: i64) -> Commit {
        Commit {
            hash: hash.to_string(),
            parents: parents.iter().map(|s| s.to_string()).collect(),
            timestamp: Utc::now() - chrono::Duration::hours(hours_ago),
            on_main: true,
        }
    }

    fn linear_chain(graph: &InMemoryRepoGraph) {
        graph.insert_commit("repo", commit("c1", &[], 3));
        graph.insert_commit("repo", commit("c2", &["c1"], 2));
        graph.insert_commit("repo", commit("c3", &["c2"], 1));
        graph.set_main_tip("repo", "c3");
    }

    #[test]
    fn is_ancestor_walks_parent_chain() {
        let graph = InMemoryRepoGraph::new();
        linear_chain(&graph);
        assert!(graph.is_ancestor("repo", "c1", "c3"));
        assert!(!graph.is_ancestor("repo", "c3", "c1"));
        assert!(graph.is_ancestor("repo", "c2", "c2"));
    }

    #[test]
    fn recurse_all_branches_visits_each_commit_once() {
        let graph = InMemoryRepoGraph::new();
        linear_chain(&graph);
        let mut seen = Vec::new();
        graph.recurse_all_branches("repo", "c3", &mut |commit| {
            seen.push(commit.hash.clone());
            Recurse::Continue
        });
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], "c3");
    }

    #[test]
    fn recurse_stop_branch_prunes_ancestors() {
        let graph = InMemoryRepoGraph::new();
        linear_chain(&graph);
        let mut seen = Vec::new();
        graph.recurse_all_branches("repo", "c3", &mut |commit| {
            seen.push(commit.hash.clone());
            if commit.hash == "c2" {
                Recurse::StopBranch
            } else {
                Recurse::Continue
            }
        });
        assert_eq!(seen, vec!["c3", "c2"]);
    }

    #[test]
    fn latest_main_commits_is_newest_first_and_bounded() {
        let graph = InMemoryRepoGraph::new();
        linear_chain(&graph);
        let latest = graph.latest_main_commits("repo", 2);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].hash, "c3");
        assert_eq!(latest[1].hash, "c2");
    }
}
