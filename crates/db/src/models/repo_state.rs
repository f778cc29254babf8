use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Coordinates of a piece of work: a repository, a revision, and an
/// optional unsubmitted patch. Two `RepoState`s are equal iff every
/// field matches (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
pub struct RepoState {
    pub repo: String,
    pub revision: String,
    pub patch: Option<Patch>,
}

/// Unsubmitted code under review: which review server, change and
/// patchset it came from, and (if different from the target) the repo
/// the patch itself lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
pub struct Patch {
    pub server: String,
    pub issue: i64,
    pub patchset: i64,
    pub patch_repo: Option<String>,
}

impl RepoState {
    pub fn new(repo: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            revision: revision.into(),
            patch: None,
        }
    }

    pub fn with_patch(repo: impl Into<String>, revision: impl Into<String>, patch: Patch) -> Self {
        Self {
            repo: repo.into(),
            revision: revision.into(),
            patch: Some(patch),
        }
    }

    /// A RepoState is "valid" iff it has a repo and revision.
    pub fn is_valid(&self) -> bool {
        !self.repo.is_empty() && !self.revision.is_empty()
    }

    /// A RepoState "is a try job" iff it carries a patch.
    pub fn is_try_job(&self) -> bool {
        self.patch.is_some()
    }

    /// Deterministic cache key derived from every field, stable across
    /// process restarts (used as the RowKey in spec.md §3).
    pub fn row_key(&self) -> String {
        match &self.patch {
            None => format!("{}@{}", self.repo, self.revision),
            Some(p) => format!(
                "{}@{}#{}:{}:{}:{}",
                self.repo,
                self.revision,
                p.server,
                p.issue,
                p.patchset,
                p.patch_repo.as_deref().unwrap_or(""),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_requires_repo_and_revision() {
        assert!(RepoState::new("repo", "rev").is_valid());
        assert!(!RepoState::new("", "rev").is_valid());
        assert!(!RepoState::new("repo", "").is_valid());
    }

    #[test]
    fn try_job_iff_patch_present() {
        assert!(!RepoState::new("repo", "rev").is_try_job());
        let with_patch = RepoState::with_patch(
            "repo",
            "rev",
            Patch {
                server: "review.example.com".into(),
                issue: 10101,
                patchset: 42,
                patch_repo: None,
            },
        );
        assert!(with_patch.is_try_job());
    }

    #[test]
    fn row_key_differs_on_any_field() {
        let a = RepoState::new("repo", "rev1");
        let b = RepoState::new("repo", "rev2");
        assert_ne!(a.row_key(), b.row_key());
    }

    #[test]
    fn equality_requires_all_fields_to_match() {
        let a = RepoState::new("repo", "rev");
        let b = RepoState::new("repo", "rev");
        let c = RepoState::with_patch(
            "repo",
            "rev",
            Patch {
                server: "s".into(),
                issue: 1,
                patchset: 1,
                patch_repo: None,
            },
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
