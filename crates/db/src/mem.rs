use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::StoreError,
    models::{job::Job, task::Task},
    store::Store,
};

/// In-memory `Store` used by component tests throughout this workspace
/// that don't need a real SQLite file (mirrors the purpose of the
/// SQLite-backed `SqliteStore` without the I/O).
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tasks: Arc<RwLock<Vec<Task>>>,
    jobs: Arc<RwLock<Vec<Job>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_task(&self, mut task: Task) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        if task.id.is_nil() {
            task.id = Uuid::new_v4();
            task.db_modified = 1;
            tasks.push(task.clone());
            return Ok(task);
        }

        match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) if existing.db_modified == task.db_modified => {
                task.db_modified += 1;
                *existing = task.clone();
                Ok(task)
            }
            Some(_) => Err(StoreError::ConcurrentUpdate),
            None if task.db_modified == 0 => {
                // Caller pre-assigned its own id (e.g. the dispatcher,
                // which needs the id before the task is durable) rather
                // than leaving it nil for us to assign.
                task.db_modified = 1;
                tasks.push(task.clone());
                Ok(task)
            }
            None => Err(StoreError::TaskNotFound),
        }
    }

    async fn put_job(&self, mut job: Job) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        if job.id.is_nil() {
            job.id = Uuid::new_v4();
            job.db_modified = 1;
            jobs.push(job.clone());
            return Ok(job);
        }

        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) if existing.db_modified == job.db_modified => {
                job.db_modified += 1;
                *existing = job.clone();
                Ok(job)
            }
            Some(_) => Err(StoreError::ConcurrentUpdate),
            None if job.db_modified == 0 => {
                job.db_modified = 1;
                jobs.push(job.clone());
                Ok(job)
            }
            None => Err(StoreError::JobNotFound),
        }
    }

    async fn get_task_by_id(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.iter().find(|t| t.id == id).cloned())
    }

    async fn get_job_by_id(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.iter().find(|j| j.id == id).cloned())
    }

    async fn get_tasks_from_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        repo: Option<&str>,
    ) -> Result<Vec<Task>, StoreError> {
        let mut matched: Vec<Task> = self
            .tasks
            .read()
            .await
            .iter()
            .filter(|t| t.created >= from && t.created < to)
            .filter(|t| repo.is_none_or(|r| t.key.repo_state.repo == r))
            .cloned()
            .collect();
        matched.sort_by_key(|t| t.created);
        Ok(matched)
    }

    async fn get_jobs_from_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        repo: Option<&str>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut matched: Vec<Job> = self
            .jobs
            .read()
            .await
            .iter()
            .filter(|j| j.created >= from && j.created < to)
            .filter(|j| repo.is_none_or(|r| j.repo_state.repo == r))
            .cloned()
            .collect();
        matched.sort_by_key(|j| j.created);
        Ok(matched)
    }
}
