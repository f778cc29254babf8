pub mod execution_service;
pub mod isolate;
pub mod repo_graph;
pub mod review_service;
pub mod task_config;

pub use execution_service::{
    BotInfo, ExecutionService, ExecutionServiceError, FakeExecutionService, TaskResult,
    TaskRunState, TriggerRequest, TriggerResult, substitute_variables,
};
pub use isolate::{InMemoryIsolateClient, IsolateClient, IsolateError, IsolatedFile};
pub use repo_graph::{Commit, InMemoryRepoGraph, Recurse, RepoGraph, RepoGraphError};
pub use review_service::{FakeReviewServiceClient, PendingBuild, ReviewServiceClient, ReviewServiceError};
pub use task_config::{FakeTaskConfigReader, JobSpec, TaskConfigError, TaskConfigReader, TaskSpec, TasksCfg, TriggerKind};
