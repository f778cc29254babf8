use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use ts_rs::TS;

#[derive(Debug, Error)]
pub enum ExecutionServiceError {
    #[error("execution service unreachable: {0}")]
    Unavailable(String),
    #[error("bot {0} not found")]
    BotNotFound(String),
    #[error("task {0} not found")]
    TaskNotFound(String),
}

/// A bot reported free by the execution service (spec.md §6 external
/// collaborator 3 / §4.8).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
pub struct BotInfo {
    pub bot_id: String,
    /// "key:value" dimensions this bot satisfies.
    pub dimensions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, JsonSchema, TS)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskRunState {
    Pending,
    Running,
    Completed,
    Expired,
    Killed,
    BotDied,
}

impl TaskRunState {
    pub fn is_done(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Request to trigger one task run on the execution service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub name: String,
    pub command: Vec<String>,
    pub dimensions: Vec<String>,
    pub env: HashMap<String, String>,
    pub isolated_input: Option<String>,
    pub expiration_secs: u64,
    pub execution_timeout_secs: u64,
    pub io_timeout_secs: u64,
    pub priority: f64,
    pub service_account: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResult {
    pub swarming_task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub swarming_task_id: String,
    pub state: TaskRunState,
    pub isolated_output: Option<String>,
    pub bot_id: Option<String>,
}

/// Substitutes `<(NAME)>` tokens in command/extra-args entries with
/// values drawn from the task's resolved environment (spec.md §4.9/§6).
pub fn substitute_variables(template: &str, values: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("<(") {
        let Some(end_rel) = rest[start..].find(")>") else {
            out.push_str(rest);
            return out;
        };
        let end = start + end_rel;
        out.push_str(&rest[..start]);
        let name = &rest[start + 2..end];
        match values.get(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..end + 2]),
        }
        rest = &rest[end + 2..];
    }
    out.push_str(rest);
    out
}

/// Talks to the system that actually runs tasks on bots (spec.md §6
/// external collaborator 3): lists free bots, triggers tasks, polls for
/// completion.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    async fn list_free_bots(&self, dimensions: &[String]) -> Result<Vec<BotInfo>, ExecutionServiceError>;
    async fn list_task_results(
        &self,
        swarming_task_ids: &[String],
    ) -> Result<Vec<TaskResult>, ExecutionServiceError>;
    async fn get_task(&self, swarming_task_id: &str) -> Result<TaskResult, ExecutionServiceError>;
    async fn trigger_task(&self, req: TriggerRequest) -> Result<TriggerResult, ExecutionServiceError>;
}

/// In-memory fake used by tests across the workspace (spec.md's own
/// "Testing tools" expectation): bots and task outcomes are seeded by
/// the test and returned deterministically rather than over HTTP.
#[derive(Default)]
pub struct FakeExecutionService {
    bots: RwLock<Vec<BotInfo>>,
    results: RwLock<HashMap<String, TaskResult>>,
    next_id: RwLock<u64>,
}

impl FakeExecutionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bot(&self, bot: BotInfo) {
        self.bots.write().expect("fake execution service lock poisoned").push(bot);
    }

    pub fn set_result(&self, swarming_task_id: &str, result: TaskResult) {
        self.results
            .write()
            .expect("fake execution service lock poisoned")
            .insert(swarming_task_id.to_string(), result);
    }
}

fn dims_satisfy(bot: &[String], required: &[String]) -> bool {
    required.iter().all(|dim| bot.contains(dim))
}

#[async_trait]
impl ExecutionService for FakeExecutionService {
    async fn list_free_bots(&self, dimensions: &[String]) -> Result<Vec<BotInfo>, ExecutionServiceError> {
        Ok(self
            .bots
            .read()
            .expect("fake execution service lock poisoned")
            .iter()
            .filter(|bot| dims_satisfy(&bot.dimensions, dimensions))
            .cloned()
            .collect())
    }

    async fn list_task_results(
        &self,
        swarming_task_ids: &[String],
    ) -> Result<Vec<TaskResult>, ExecutionServiceError> {
        let results = self.results.read().expect("fake execution service lock poisoned");
        Ok(swarming_task_ids.iter().filter_map(|id| results.get(id).cloned()).collect())
    }

    async fn get_task(&self, swarming_task_id: &str) -> Result<TaskResult, ExecutionServiceError> {
        self.results
            .read()
            .expect("fake execution service lock poisoned")
            .get(swarming_task_id)
            .cloned()
            .ok_or_else(|| ExecutionServiceError::TaskNotFound(swarming_task_id.to_string()))
    }

    async fn trigger_task(&self, _req: TriggerRequest) -> Result<TriggerResult, ExecutionServiceError> {
        let mut next_id = self.next_id.write().expect("fake execution service lock poisoned");
        *next_id += 1;
        let id = format!("fake-swarming-{next_id}");
        self.results.write().expect("fake execution service lock poisoned").insert(
            id.clone(),
            TaskResult {
                swarming_task_id: id.clone(),
                state: TaskRunState::Pending,
                isolated_output: None,
                bot_id: None,
            },
        );
        Ok(TriggerResult { swarming_task_id: id })
    }
}
