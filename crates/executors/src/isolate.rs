use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IsolateError {
    #[error("isolated bundle {0} not found")]
    NotFound(String),
    #[error("isolate service unreachable: {0}")]
    Unavailable(String),
}

/// One file within an isolated bundle (spec.md §6 external collaborator
/// 4): content-addressed by its sha256 digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedFile {
    pub digest: String,
    pub bytes: Vec<u8>,
}

impl IsolatedFile {
    pub fn new(bytes: Vec<u8>) -> Self {
        let digest = format!("{:x}", Sha256::digest(&bytes));
        Self { digest, bytes }
    }
}

/// Stores and retrieves content-addressed input/output bundles used to
/// ship a task's working tree to and from a bot (spec.md §6 external
/// collaborator 4).
#[async_trait]
pub trait IsolateClient: Send + Sync {
    async fn get(&self, digest: &str) -> Result<IsolatedFile, IsolateError>;

    /// Re-uploads (or confirms presence of) a bundle so the dispatcher
    /// can safely reference its digest in a trigger request, even when
    /// the original upload may have expired out of cold storage
    /// (spec.md §4.9 dispatcher responsibility).
    async fn re_upload_isolated_files(&self, digest: &str) -> Result<String, IsolateError>;
}

/// In-memory `IsolateClient` for tests: `re_upload_isolated_files` is a
/// no-op identity since nothing ever actually expires.
#[derive(Default)]
pub struct InMemoryIsolateClient {
    files: RwLock<HashMap<String, IsolatedFile>>,
}

impl InMemoryIsolateClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, file: IsolatedFile) -> String {
        let digest = file.digest.clone();
        self.files.write().expect("isolate client lock poisoned").insert(digest.clone(), file);
        digest
    }
}

#[async_trait]
impl IsolateClient for InMemoryIsolateClient {
    async fn get(&self, digest: &str) -> Result<IsolatedFile, IsolateError> {
        self.files
            .read()
            .expect("isolate client lock poisoned")
            .get(digest)
            .cloned()
            .ok_or_else(|| IsolateError::NotFound(digest.to_string()))
    }

    async fn re_upload_isolated_files(&self, digest: &str) -> Result<String, IsolateError> {
        if self.files.read().expect("isolate client lock poisoned").contains_key(digest) {
            Ok(digest.to_string())
        } else {
            Err(IsolateError::NotFound(digest.to_string()))
        }
    }
}
