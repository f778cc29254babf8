use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use ts_rs::TS;

/// Declarative description of a task (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
pub struct TaskSpec {
    pub name: String,
    pub command: Vec<String>,
    pub isolate_handle: String,
    /// "key:value" dimension requirements, ANDed.
    pub dimensions: Vec<String>,
    pub env: HashMap<String, String>,
    pub env_prefixes: HashMap<String, Vec<String>>,
    pub cipd_packages: Vec<String>,
    /// Names of other task specs in the same config this depends on.
    pub dependencies: Vec<String>,
    /// 0..1
    pub priority: f64,
    pub expiration_secs: u64,
    pub execution_timeout_secs: u64,
    pub io_timeout_secs: u64,
    pub extra_args: Vec<String>,
    pub extra_tags: Vec<String>,
    pub outputs: Vec<String>,
    pub service_account: Option<String>,
    pub max_attempts: u32,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: Vec::new(),
            isolate_handle: String::new(),
            dimensions: Vec::new(),
            env: HashMap::new(),
            env_prefixes: HashMap::new(),
            cipd_packages: Vec::new(),
            dependencies: Vec::new(),
            priority: 0.5,
            expiration_secs: 0,
            execution_timeout_secs: 0,
            io_timeout_secs: 0,
            extra_args: Vec::new(),
            extra_tags: Vec::new(),
            outputs: Vec::new(),
            service_account: None,
            max_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, JsonSchema, TS)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    AnyBranch,
    MainOnly,
    Nightly,
    Weekly,
    OnDemand,
    Manual,
    Try,
}

/// Declarative description of a job (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
pub struct JobSpec {
    pub name: String,
    pub task_specs: Vec<String>,
    pub priority: f64,
    pub trigger: TriggerKind,
}

/// `{tasks: map<name, TaskSpec>, jobs: map<name, JobSpec>}` (spec.md §4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasksCfg {
    pub tasks: HashMap<String, TaskSpec>,
    pub jobs: HashMap<String, JobSpec>,
}

#[derive(Debug, Error, Clone)]
pub enum TaskConfigError {
    #[error("transient error resolving task config: {0}")]
    Transient(String),
    #[error("permanent config error: {0}")]
    Permanent(String),
    #[error("task config not found")]
    NotFound,
}

impl TaskConfigError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl TasksCfg {
    /// Validates the task-spec DAG at load time (spec.md §9): rejects
    /// self-loops, rejects cycles via three-color DFS, rejects tasks
    /// unreachable from any job.
    pub fn validate(&self) -> Result<(), TaskConfigError> {
        for spec in self.tasks.values() {
            if spec.dependencies.iter().any(|d| d == &spec.name) {
                return Err(TaskConfigError::Permanent(format!(
                    "task '{}' depends on itself",
                    spec.name
                )));
            }
            for dep in &spec.dependencies {
                if !self.tasks.contains_key(dep) {
                    return Err(TaskConfigError::Permanent(format!(
                        "task '{}' depends on unknown task '{}'",
                        spec.name, dep
                    )));
                }
            }
        }

        let mut colors: HashMap<&str, Color> =
            self.tasks.keys().map(|name| (name.as_str(), Color::White)).collect();

        for name in self.tasks.keys() {
            if colors.get(name.as_str()) == Some(&Color::White) {
                self.visit_for_cycle(name, &mut colors)?;
            }
        }

        let mut reachable: HashSet<&str> = HashSet::new();
        for job in self.jobs.values() {
            for task_name in &job.task_specs {
                self.collect_transitive(task_name, &mut reachable);
            }
        }
        for name in self.tasks.keys() {
            if !reachable.contains(name.as_str()) {
                return Err(TaskConfigError::Permanent(format!(
                    "task '{name}' is unreachable from any job"
                )));
            }
        }

        Ok(())
    }

    fn visit_for_cycle<'a>(
        &'a self,
        name: &'a str,
        colors: &mut HashMap<&'a str, Color>,
    ) -> Result<(), TaskConfigError> {
        colors.insert(name, Color::Gray);
        if let Some(spec) = self.tasks.get(name) {
            for dep in &spec.dependencies {
                match colors.get(dep.as_str()) {
                    Some(Color::Gray) => {
                        return Err(TaskConfigError::Permanent(format!(
                            "cycle detected through task '{dep}'"
                        )));
                    }
                    Some(Color::Black) => continue,
                    _ => self.visit_for_cycle(dep, colors)?,
                }
            }
        }
        colors.insert(name, Color::Black);
        Ok(())
    }

    fn collect_transitive<'a>(&'a self, name: &'a str, reachable: &mut HashSet<&'a str>) {
        if !reachable.insert(name) {
            return;
        }
        if let Some(spec) = self.tasks.get(name) {
            for dep in &spec.dependencies {
                self.collect_transitive(dep, reachable);
            }
        }
    }

    /// Transitive dependency closure for one job's leaf task specs, used
    /// by `MakeJob` (spec.md §4.2).
    pub fn transitive_dependencies(&self, job_name: &str) -> HashMap<String, Vec<String>> {
        let mut out = HashMap::new();
        let Some(job) = self.jobs.get(job_name) else {
            return out;
        };
        for leaf in &job.task_specs {
            let mut reachable = HashSet::new();
            self.collect_transitive(leaf, &mut reachable);
            let mut deps: Vec<String> = reachable.into_iter().map(str::to_string).collect();
            deps.sort();
            out.insert(leaf.clone(), deps);
        }
        out
    }
}

/// Given a RepoState, returns the raw tasks.json content after applying
/// any patch (spec.md §6 external collaborator 2).
#[async_trait]
pub trait TaskConfigReader: Send + Sync {
    async fn read(
        &self,
        repo: &str,
        revision: &str,
        patch: Option<&str>,
    ) -> Result<TasksCfg, TaskConfigError>;
}

/// In-memory `TaskConfigReader` for tests: every repo shares the one
/// `TasksCfg` seeded via `set`, regardless of revision or patch.
#[derive(Default)]
pub struct FakeTaskConfigReader {
    cfg: std::sync::RwLock<TasksCfg>,
}

impl FakeTaskConfigReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, cfg: TasksCfg) {
        *self.cfg.write().expect("fake task config reader lock poisoned") = cfg;
    }
}

#[async_trait]
impl TaskConfigReader for FakeTaskConfigReader {
    async fn read(&self, _repo: &str, _revision: &str, _patch: Option<&str>) -> Result<TasksCfg, TaskConfigError> {
        Ok(self.cfg.read().expect("fake task config reader lock poisoned").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            ..TaskSpec::default()
        }
    }

    fn cfg(tasks: Vec<TaskSpec>, jobs: Vec<(&str, Vec<&str>)>) -> TasksCfg {
        let mut cfg = TasksCfg::default();
        for task in tasks {
            cfg.tasks.insert(task.name.clone(), task);
        }
        for (name, leaves) in jobs {
            cfg.jobs.insert(
                name.to_string(),
                JobSpec {
                    name: name.to_string(),
                    task_specs: leaves.iter().map(|s| s.to_string()).collect(),
                    priority: 0.5,
                    trigger: TriggerKind::AnyBranch,
                },
            );
        }
        cfg
    }

    #[test]
    fn rejects_self_loop() {
        let c = cfg(vec![spec("A", &["A"])], vec![("job", vec!["A"])]);
        assert!(c.validate().unwrap_err().is_permanent());
    }

    #[test]
    fn rejects_cycle() {
        let c = cfg(
            vec![spec("A", &["B"]), spec("B", &["A"])],
            vec![("job", vec!["A"])],
        );
        assert!(c.validate().unwrap_err().is_permanent());
    }

    #[test]
    fn rejects_unreachable_task() {
        let c = cfg(
            vec![spec("A", &[]), spec("Orphan", &[])],
            vec![("job", vec!["A"])],
        );
        assert!(c.validate().is_err());
    }

    #[test]
    fn accepts_valid_dag() {
        let c = cfg(
            vec![spec("Build", &[]), spec("Test", &["Build"])],
            vec![("job", vec!["Test"])],
        );
        assert!(c.validate().is_ok());
    }

    #[test]
    fn transitive_dependencies_includes_the_leaf_itself() {
        let c = cfg(
            vec![spec("Build", &[]), spec("Test", &["Build"])],
            vec![("job", vec!["Test"])],
        );
        let deps = c.transitive_dependencies("job");
        let mut test_deps = deps.get("Test").expect("leaf present").clone();
        test_deps.sort();
        assert_eq!(test_deps, vec!["Build".to_string(), "Test".to_string()]);
    }
}
