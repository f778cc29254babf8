use forge_core_db::{
    models::{
        job::{Job, JobStatus},
        repo_state::{Patch, RepoState},
    },
    retry_on_concurrent_update, Store, StoreError,
};
use forge_core_executors::{PendingBuild, ReviewServiceClient, ReviewServiceError};
use rand::Rng;
use thiserror::Error;

const NUM_RETRIES: u32 = 3;
const HEARTBEAT_BATCH_SIZE: usize = 25;
const MAX_PEEK: usize = 50;

#[derive(Debug, Error)]
pub enum TryJobIntegratorError {
    #[error(transparent)]
    Review(#[from] ReviewServiceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a try-job build failed, as reported back to the review service
/// (spec.md §4.12 "Completion").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    BuildFailure,
    InfraFailure,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildFailure => "BUILD_FAILURE",
            Self::InfraFailure => "INFRA_FAILURE",
        }
    }
}

/// Leases pending try-job builds from the review service and keeps
/// their leases alive until the associated job completes (spec.md
/// §4.12).
pub struct TryJobIntegrator<'a> {
    review: &'a dyn ReviewServiceClient,
}

impl<'a> TryJobIntegrator<'a> {
    pub fn new(review: &'a dyn ReviewServiceClient) -> Self {
        Self { review }
    }

    /// Poll pathway: lease up to `MAX_PEEK` pending builds and persist a
    /// Job for each one that validates.
    pub async fn poll(
        &self,
        store: &dyn Store,
        existing_job_for: impl Fn(&RepoState, &str) -> bool,
    ) -> Result<Vec<Job>, TryJobIntegratorError> {
        let pending = self.review.peek(MAX_PEEK).await?;
        let mut created = Vec::new();

        for build in pending {
            match self.intake_one(store, &build, &existing_job_for).await {
                Ok(job) => created.push(job),
                Err(_) => {
                    let _ = self.review.cancel(&build.build_id, "validation failed").await;
                }
            }
        }

        Ok(created)
    }

    async fn intake_one(
        &self,
        store: &dyn Store,
        build: &PendingBuild,
        existing_job_for: &impl Fn(&RepoState, &str) -> bool,
    ) -> Result<Job, TryJobIntegratorError> {
        let leased = self.review.lease(&build.build_id).await?;

        let repo_state = RepoState::with_patch(
            leased.repo.clone(),
            leased.revision.clone(),
            Patch {
                server: "review".to_string(),
                issue: 0,
                patchset: 0,
                patch_repo: Some(leased.patch.clone()),
            },
        );

        let is_force = existing_job_for(&repo_state, &leased.job_name);
        let lease_key = rand::rng().random_range(1..i64::MAX);
        let build_id: i64 = leased.build_id.parse().unwrap_or(0);

        let job = Job {
            id: uuid::Uuid::nil(),
            name: leased.job_name.clone(),
            repo_state,
            created: chrono::Utc::now(),
            finished: None,
            status: JobStatus::InProgress,
            is_force,
            dependencies: Default::default(),
            tasks: Default::default(),
            priority: 0.5,
            buildbucket_build_id: Some(build_id),
            buildbucket_lease_key: Some(lease_key),
            db_modified: 0,
        };

        let saved = retry_on_concurrent_update(NUM_RETRIES, {
            let store = store;
            let job = job.clone();
            move || {
                let job = job.clone();
                async move { store.put_job(job).await }
            }
        })
        .await?;

        self.review.start(&build.build_id).await?;
        Ok(saved)
    }

    /// Heartbeat loop: keeps every actively-leased job's build alive.
    /// Batches fail together; the jobs in a failed batch are handed
    /// back so the caller can cancel them locally.
    pub async fn heartbeat(&self, active: &[Job]) -> Vec<uuid::Uuid> {
        let leased: Vec<&Job> = active.iter().filter(|j| j.buildbucket_lease_key.is_some_and(|k| k != 0)).collect();
        let mut failed = Vec::new();

        for batch in leased.chunks(HEARTBEAT_BATCH_SIZE) {
            let ids: Vec<String> = batch
                .iter()
                .filter_map(|j| j.buildbucket_build_id.map(|id| id.to_string()))
                .collect();
            if self.review.heartbeat_batch(&ids).await.is_err() {
                failed.extend(batch.iter().map(|j| j.id));
            }
        }
        failed
    }

    /// Completion pathway: reports a done job's outcome back to the
    /// review service and clears its lease key.
    pub async fn complete(&self, store: &dyn Store, mut job: Job) -> Result<Job, TryJobIntegratorError> {
        let Some(build_id) = job.buildbucket_build_id else { return Ok(job) };
        let build_id_str = build_id.to_string();

        let outcome = match job.status {
            JobStatus::Success => self.review.succeed(&build_id_str).await,
            JobStatus::Failure => self.review.fail(&build_id_str, FailureReason::BuildFailure.as_str()).await,
            JobStatus::Mishap => self.review.fail(&build_id_str, FailureReason::InfraFailure.as_str()).await,
            JobStatus::Canceled => self.review.cancel(&build_id_str, "job canceled").await,
            JobStatus::InProgress => return Ok(job),
        };

        // "BUILD_IS_COMPLETED" acks are tolerated as benign idempotent
        // replies (spec.md §4.12); any other error propagates.
        if let Err(err) = outcome {
            if !matches!(err, ReviewServiceError::AlreadyCompleted(_)) {
                return Err(err.into());
            }
        }

        job.buildbucket_lease_key = None;
        let saved = retry_on_concurrent_update(NUM_RETRIES, {
            let store = store;
            let job = job.clone();
            move || {
                let job = job.clone();
                async move { store.put_job(job).await }
            }
        })
        .await?;
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use forge_core_db::InMemoryStore;
    use forge_core_executors::{FakeReviewServiceClient, TriggerKind};

    use super::*;

    fn build(id: &str) -> PendingBuild {
        PendingBuild {
            build_id: id.to_string(),
            repo: "repo".to_string(),
            revision: "rev".to_string(),
            patch: "patch-repo".to_string(),
            job_name: "presubmit".to_string(),
            trigger: TriggerKind::Try,
        }
    }

    #[tokio::test]
    async fn poll_leases_and_persists_a_job_per_pending_build() {
        let review = FakeReviewServiceClient::new();
        review.push(build("1"));
        let store = InMemoryStore::new();
        let integrator = TryJobIntegrator::new(&review);

        let jobs = integrator.poll(&store, |_, _| false).await.expect("poll");
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].buildbucket_lease_key.is_some());
        assert!(!jobs[0].is_force);
    }

    #[tokio::test]
    async fn poll_marks_is_force_when_prior_job_exists() {
        let review = FakeReviewServiceClient::new();
        review.push(build("2"));
        let store = InMemoryStore::new();
        let integrator = TryJobIntegrator::new(&review);

        let jobs = integrator.poll(&store, |_, _| true).await.expect("poll");
        assert!(jobs[0].is_force);
    }

    #[tokio::test]
    async fn heartbeat_skips_jobs_without_an_active_lease() {
        let review = FakeReviewServiceClient::new();
        let integrator = TryJobIntegrator::new(&review);

        let mut job = sample_job();
        job.buildbucket_lease_key = None;
        let failed = integrator.heartbeat(&[job]).await;
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn complete_clears_lease_key_on_success() {
        let review = FakeReviewServiceClient::new();
        let store = InMemoryStore::new();
        let integrator = TryJobIntegrator::new(&review);

        let mut job = sample_job();
        job.status = JobStatus::Success;
        job.buildbucket_build_id = Some(99);
        job = store.put_job(job).await.expect("insert");

        let completed = integrator.complete(&store, job).await.expect("complete");
        assert!(completed.buildbucket_lease_key.is_none());
    }

    fn sample_job() -> Job {
        Job {
            id: uuid::Uuid::nil(),
            name: "presubmit".into(),
            repo_state: RepoState::new("repo", "rev"),
            created: chrono::Utc::now(),
            finished: None,
            status: JobStatus::InProgress,
            is_force: false,
            dependencies: Default::default(),
            tasks: Default::default(),
            priority: 0.5,
            buildbucket_build_id: Some(1),
            buildbucket_lease_key: Some(123),
            db_modified: 0,
        }
    }
}
