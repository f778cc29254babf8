use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// All of the cadence, limit and scoring knobs named in the spec's
/// "Tick cadence and limits" table, plus storage connection info.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub main_loop_period_secs: u64,
    pub completion_poll_period_secs: u64,
    pub repo_update_period_secs: u64,
    pub try_job_poll_period_secs: u64,
    pub try_job_heartbeat_period_secs: u64,
    pub initial_try_job_lease_secs: u64,
    pub renewed_try_job_lease_secs: u64,

    pub max_blamelist_commits: usize,
    pub num_top_candidates_diagnostics: usize,
    pub max_txn_docs: usize,
    pub default_max_attempts: u32,
    pub num_retries: u32,

    pub force_run_base: f64,
    pub try_job_base: f64,
    pub retry_mult: f64,
    pub failure_or_mishap_bonus: f64,
    pub default_job_priority: f64,
    pub decay_24hr: f64,

    pub diagnostics_write_timeout_secs: u64,
    pub trigger_timeout_secs: u64,

    pub window_period_secs: u64,
    pub window_num_commits: u64,

    pub database_url: String,
    pub data_dir: String,
    pub http_bind_addr: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            main_loop_period_secs: 5,
            completion_poll_period_secs: 5 * 60,
            repo_update_period_secs: 10,
            try_job_poll_period_secs: 10,
            try_job_heartbeat_period_secs: 30,
            initial_try_job_lease_secs: 5 * 60,
            renewed_try_job_lease_secs: 60 * 60,

            max_blamelist_commits: 500,
            num_top_candidates_diagnostics: 50,
            max_txn_docs: 500,
            default_max_attempts: 2,
            num_retries: 5,

            force_run_base: 100.0,
            try_job_base: 10.0,
            retry_mult: 0.75,
            failure_or_mishap_bonus: 0.75,
            default_job_priority: 0.5,
            decay_24hr: 0.5,

            diagnostics_write_timeout_secs: 60,
            trigger_timeout_secs: 60,

            window_period_secs: 4 * 24 * 60 * 60,
            window_num_commits: 1000,

            database_url: "sqlite://forge-scheduler.db".to_string(),
            data_dir: "./data".to_string(),
            http_bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// `SCHED_LIMIT_PER_TASK_SPEC = max_txn_docs / 2` (spec §4.8).
    pub fn sched_limit_per_task_spec(&self) -> usize {
        self.max_txn_docs / 2
    }

    /// Batch helpers chunk at `K/2` to leave headroom for blamelist-driven
    /// updates of prior tasks (spec §4.4).
    pub fn txn_batch_size(&self) -> usize {
        (self.max_txn_docs / 2).max(1)
    }

    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            _ => Self::default(),
        };

        if let Ok(url) = std::env::var("FORGE_SCHEDULER_DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(addr) = std::env::var("FORGE_SCHEDULER_HTTP_ADDR") {
            config.http_bind_addr = addr;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sched_limit_is_half_of_txn_docs() {
        let config = SchedulerConfig::default();
        assert_eq!(config.sched_limit_per_task_spec(), config.max_txn_docs / 2);
    }

    #[test]
    fn load_without_file_falls_back_to_defaults() {
        let config = SchedulerConfig::load(None).expect("defaults always load");
        assert_eq!(config.max_blamelist_commits, 500);
    }

    #[test]
    fn load_from_toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scheduler.toml");
        std::fs::write(&path, "max_blamelist_commits = 10\n").expect("write");
        let config = SchedulerConfig::load(Some(&path)).expect("load");
        assert_eq!(config.max_blamelist_commits, 10);
        assert_eq!(config.default_max_attempts, 2);
    }
}
