use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::task_config::TriggerKind;

#[derive(Debug, Error)]
pub enum ReviewServiceError {
    #[error("review service unreachable: {0}")]
    Unavailable(String),
    #[error("build {0} not found")]
    NotFound(String),
    #[error("build {0} already leased")]
    AlreadyLeased(String),
    /// Benign idempotent ack: the review service already considers this
    /// build completed (spec.md §4.12).
    #[error("build {0} already completed")]
    AlreadyCompleted(String),
}

/// A try-job request pending against a code-review patch (spec.md §6
/// external collaborator 5 / §4.12).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBuild {
    pub build_id: String,
    pub repo: String,
    pub revision: String,
    pub patch: String,
    pub job_name: String,
    pub trigger: TriggerKind,
}

/// Talks to the code-review system's try-job queue (spec.md §6 external
/// collaborator 5): peek at pending builds, lease one for processing,
/// keep the lease alive, and report the outcome back.
#[async_trait]
pub trait ReviewServiceClient: Send + Sync {
    async fn peek(&self, max: usize) -> Result<Vec<PendingBuild>, ReviewServiceError>;
    async fn lease(&self, build_id: &str) -> Result<PendingBuild, ReviewServiceError>;
    async fn heartbeat_batch(&self, build_ids: &[String]) -> Result<(), ReviewServiceError>;
    async fn start(&self, build_id: &str) -> Result<(), ReviewServiceError>;
    async fn succeed(&self, build_id: &str) -> Result<(), ReviewServiceError>;
    async fn fail(&self, build_id: &str, reason: &str) -> Result<(), ReviewServiceError>;
    async fn cancel(&self, build_id: &str, reason: &str) -> Result<(), ReviewServiceError>;
}

struct LeasedBuild {
    build: PendingBuild,
    leased: bool,
    last_heartbeat: Option<DateTime<Utc>>,
}

/// In-memory `ReviewServiceClient` for tests: builds are queued with
/// `push`, leased in FIFO order, and state transitions are tracked so
/// assertions can confirm exactly one lease holder per build.
#[derive(Default)]
pub struct FakeReviewServiceClient {
    builds: RwLock<Vec<LeasedBuild>>,
}

impl FakeReviewServiceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, build: PendingBuild) {
        self.builds.write().expect("review service lock poisoned").push(LeasedBuild {
            build,
            leased: false,
            last_heartbeat: None,
        });
    }
}

#[async_trait]
impl ReviewServiceClient for FakeReviewServiceClient {
    async fn peek(&self, max: usize) -> Result<Vec<PendingBuild>, ReviewServiceError> {
        Ok(self
            .builds
            .read()
            .expect("review service lock poisoned")
            .iter()
            .filter(|entry| !entry.leased)
            .take(max)
            .map(|entry| entry.build.clone())
            .collect())
    }

    async fn lease(&self, build_id: &str) -> Result<PendingBuild, ReviewServiceError> {
        let mut builds = self.builds.write().expect("review service lock poisoned");
        let entry = builds
            .iter_mut()
            .find(|entry| entry.build.build_id == build_id)
            .ok_or_else(|| ReviewServiceError::NotFound(build_id.to_string()))?;
        if entry.leased {
            return Err(ReviewServiceError::AlreadyLeased(build_id.to_string()));
        }
        entry.leased = true;
        Ok(entry.build.clone())
    }

    async fn heartbeat_batch(&self, build_ids: &[String]) -> Result<(), ReviewServiceError> {
        let mut builds = self.builds.write().expect("review service lock poisoned");
        for id in build_ids {
            if let Some(entry) = builds.iter_mut().find(|entry| &entry.build.build_id == id) {
                entry.last_heartbeat = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn start(&self, _build_id: &str) -> Result<(), ReviewServiceError> {
        Ok(())
    }

    async fn succeed(&self, build_id: &str) -> Result<(), ReviewServiceError> {
        self.remove(build_id)
    }

    async fn fail(&self, build_id: &str, _reason: &str) -> Result<(), ReviewServiceError> {
        self.remove(build_id)
    }

    async fn cancel(&self, build_id: &str, _reason: &str) -> Result<(), ReviewServiceError> {
        self.remove(build_id)
    }
}

impl FakeReviewServiceClient {
    fn remove(&self, build_id: &str) -> Result<(), ReviewServiceError> {
        let mut builds = self.builds.write().expect("review service lock poisoned");
        let before = builds.len();
        builds.retain(|entry| entry.build.build_id != build_id);
        if builds.len() == before {
            return Err(ReviewServiceError::NotFound(build_id.to_string()));
        }
        Ok(())
    }
}
