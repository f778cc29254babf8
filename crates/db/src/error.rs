use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("concurrent update: stored db_modified does not match caller's")]
    ConcurrentUpdate,
    #[error("task not found")]
    TaskNotFound,
    #[error("job not found")]
    JobNotFound,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_concurrent_update(&self) -> bool {
        matches!(self, Self::ConcurrentUpdate)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TaskNotFound | Self::JobNotFound)
    }
}
