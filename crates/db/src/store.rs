use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::StoreError,
    models::{job::Job, task::Task},
};

/// Durable, transactional storage of `Task` and `Job` records with
/// optimistic concurrency (spec.md §4.4). Implementations must assign
/// globally unique ids and bump `db_modified` strictly on every write.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_task(&self, task: Task) -> Result<Task, StoreError>;
    async fn put_job(&self, job: Job) -> Result<Job, StoreError>;
    async fn get_task_by_id(&self, id: Uuid) -> Result<Option<Task>, StoreError>;
    async fn get_job_by_id(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Returns tasks with `Created` in `[from, to)`, ascending, optionally
    /// restricted to one repo.
    async fn get_tasks_from_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        repo: Option<&str>,
    ) -> Result<Vec<Task>, StoreError>;

    /// Returns jobs with `Created` in `[from, to)`, ascending, optionally
    /// restricted to one repo.
    async fn get_jobs_from_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        repo: Option<&str>,
    ) -> Result<Vec<Job>, StoreError>;
}

/// Retries `op` up to `num_retries` times while it reports
/// `StoreError::ConcurrentUpdate`, per spec.md §4.4/§7.
pub async fn retry_on_concurrent_update<T, F, Fut>(
    num_retries: u32,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_concurrent_update() && attempt < num_retries => {
                attempt += 1;
                tracing::debug!(attempt, "retrying after ConcurrentUpdate");
                continue;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Chunks `items` at `max_txn_docs / 2` to leave headroom in each
/// transaction for blamelist-driven updates of prior tasks (spec.md §4.4).
pub fn chunk_for_txn<T>(items: Vec<T>, max_txn_docs: usize) -> Vec<Vec<T>> {
    let chunk_size = (max_txn_docs / 2).max(1);
    items
        .into_iter()
        .fold(Vec::new(), |mut chunks: Vec<Vec<T>>, item| {
            match chunks.last_mut() {
                Some(last) if last.len() < chunk_size => last.push(item),
                _ => chunks.push(vec![item]),
            }
            chunks
        })
}
