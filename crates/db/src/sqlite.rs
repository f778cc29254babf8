use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::{
    error::StoreError,
    models::{
        job::{Job, JobStatus, TaskSummary},
        repo_state::{Patch, RepoState},
        task::{Task, TaskKey, TaskStatus},
    },
    store::Store,
};

/// `Store` implementation backed by SQLite via `sqlx`. Structured
/// sub-objects (`RepoState`, `Commits`, `Dependencies`, ...) are stored as
/// JSON text columns and (de)serialized at the boundary, the same way
/// the config service in this codebase's `services` crate persists
/// structured settings next to scalar columns.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                repo TEXT NOT NULL,
                revision TEXT NOT NULL,
                patch_json TEXT,
                task_spec_name TEXT NOT NULL,
                forced_job_id TEXT,
                attempt INTEGER NOT NULL,
                status TEXT NOT NULL,
                retry_of TEXT,
                commits_json TEXT NOT NULL,
                jobs_json TEXT NOT NULL,
                parent_task_ids_json TEXT NOT NULL,
                isolated_input TEXT,
                isolated_output TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                swarming_task_id TEXT,
                max_attempts INTEGER NOT NULL,
                db_modified INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                repo TEXT NOT NULL,
                revision TEXT NOT NULL,
                patch_json TEXT,
                created_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL,
                is_force INTEGER NOT NULL,
                dependencies_json TEXT NOT NULL,
                tasks_json TEXT NOT NULL,
                priority REAL NOT NULL,
                buildbucket_build_id INTEGER,
                buildbucket_lease_key INTEGER,
                db_modified INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS tasks_created_idx ON tasks(created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS jobs_created_idx ON jobs(created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Task, StoreError> {
        let patch_json: Option<String> = row.try_get("patch_json")?;
        let patch: Option<Patch> = patch_json.map(|s| serde_json::from_str(&s)).transpose()?;
        let forced_job_id: Option<String> = row.try_get("forced_job_id")?;
        let status_str: String = row.try_get("status")?;
        let commits_json: String = row.try_get("commits_json")?;
        let jobs_json: String = row.try_get("jobs_json")?;
        let parents_json: String = row.try_get("parent_task_ids_json")?;

        Ok(Task {
            id: Uuid::parse_str(&row.try_get::<String, _>("id")?)
                .map_err(|_| StoreError::TaskNotFound)?,
            key: TaskKey {
                repo_state: RepoState {
                    repo: row.try_get("repo")?,
                    revision: row.try_get("revision")?,
                    patch,
                },
                name: row.try_get("task_spec_name")?,
                forced_job_id: forced_job_id
                    .map(|s| Uuid::parse_str(&s))
                    .transpose()
                    .map_err(|_| StoreError::TaskNotFound)?,
            },
            attempt: row.try_get::<i64, _>("attempt")? as u32,
            status: status_str.parse().unwrap_or(TaskStatus::Pending),
            retry_of: row
                .try_get::<Option<String>, _>("retry_of")?
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .map_err(|_| StoreError::TaskNotFound)?,
            commits: serde_json::from_str(&commits_json)?,
            jobs: serde_json::from_str(&jobs_json)?,
            parent_task_ids: serde_json::from_str(&parents_json)?,
            isolated_input: row.try_get("isolated_input")?,
            isolated_output: row.try_get("isolated_output")?,
            created: row.try_get("created_at")?,
            started: row.try_get("started_at")?,
            finished: row.try_get("finished_at")?,
            swarming_task_id: row.try_get("swarming_task_id")?,
            max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
            db_modified: row.try_get("db_modified")?,
        })
    }

    fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job, StoreError> {
        let patch_json: Option<String> = row.try_get("patch_json")?;
        let patch: Option<Patch> = patch_json.map(|s| serde_json::from_str(&s)).transpose()?;
        let status_str: String = row.try_get("status")?;
        let deps_json: String = row.try_get("dependencies_json")?;
        let tasks_json: String = row.try_get("tasks_json")?;

        Ok(Job {
            id: Uuid::parse_str(&row.try_get::<String, _>("id")?)
                .map_err(|_| StoreError::JobNotFound)?,
            name: row.try_get("name")?,
            repo_state: RepoState {
                repo: row.try_get("repo")?,
                revision: row.try_get("revision")?,
                patch,
            },
            created: row.try_get("created_at")?,
            finished: row.try_get("finished_at")?,
            status: status_str.parse().unwrap_or(JobStatus::InProgress),
            is_force: row.try_get::<i64, _>("is_force")? != 0,
            dependencies: serde_json::from_str(&deps_json)?,
            tasks: serde_json::from_str::<std::collections::HashMap<String, Vec<TaskSummary>>>(
                &tasks_json,
            )?,
            priority: row.try_get("priority")?,
            buildbucket_build_id: row.try_get("buildbucket_build_id")?,
            buildbucket_lease_key: row.try_get("buildbucket_lease_key")?,
            db_modified: row.try_get("db_modified")?,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn put_task(&self, mut task: Task) -> Result<Task, StoreError> {
        if task.id.is_nil() {
            task.id = Uuid::new_v4();
        } else {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT db_modified FROM tasks WHERE id = ?")
                    .bind(task.id.to_string())
                    .fetch_optional(&self.pool)
                    .await?;
            match current {
                Some(stored) if stored != task.db_modified => {
                    return Err(StoreError::ConcurrentUpdate);
                }
                // A pre-assigned id (the dispatcher needs the id before
                // the task is durable) that isn't in the table yet is a
                // fresh insert, not a conflict.
                None if task.db_modified != 0 => return Err(StoreError::TaskNotFound),
                _ => {}
            }
        }
        task.db_modified += 1;

        let patch_json = task
            .key
            .repo_state
            .patch
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let commits_json = serde_json::to_string(&task.commits)?;
        let jobs_json = serde_json::to_string(&task.jobs)?;
        let parents_json = serde_json::to_string(&task.parent_task_ids)?;

        sqlx::query(
            r#"INSERT INTO tasks (
                id, repo, revision, patch_json, task_spec_name, forced_job_id,
                attempt, status, retry_of, commits_json, jobs_json,
                parent_task_ids_json, isolated_input, isolated_output,
                created_at, started_at, finished_at, swarming_task_id,
                max_attempts, db_modified
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                retry_of = excluded.retry_of,
                commits_json = excluded.commits_json,
                jobs_json = excluded.jobs_json,
                parent_task_ids_json = excluded.parent_task_ids_json,
                isolated_input = excluded.isolated_input,
                isolated_output = excluded.isolated_output,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                swarming_task_id = excluded.swarming_task_id,
                db_modified = excluded.db_modified"#,
        )
        .bind(task.id.to_string())
        .bind(&task.key.repo_state.repo)
        .bind(&task.key.repo_state.revision)
        .bind(patch_json)
        .bind(&task.key.name)
        .bind(task.key.forced_job_id.map(|id| id.to_string()))
        .bind(task.attempt as i64)
        .bind(task.status.to_string())
        .bind(task.retry_of.map(|id| id.to_string()))
        .bind(commits_json)
        .bind(jobs_json)
        .bind(parents_json)
        .bind(&task.isolated_input)
        .bind(&task.isolated_output)
        .bind(task.created)
        .bind(task.started)
        .bind(task.finished)
        .bind(&task.swarming_task_id)
        .bind(task.max_attempts as i64)
        .bind(task.db_modified)
        .execute(&self.pool)
        .await?;

        Ok(task)
    }

    async fn put_job(&self, mut job: Job) -> Result<Job, StoreError> {
        if job.id.is_nil() {
            job.id = Uuid::new_v4();
        } else {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT db_modified FROM jobs WHERE id = ?")
                    .bind(job.id.to_string())
                    .fetch_optional(&self.pool)
                    .await?;
            match current {
                Some(stored) if stored != job.db_modified => {
                    return Err(StoreError::ConcurrentUpdate);
                }
                None if job.db_modified != 0 => return Err(StoreError::JobNotFound),
                _ => {}
            }
        }
        job.db_modified += 1;

        let patch_json = job
            .repo_state
            .patch
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let deps_json = serde_json::to_string(&job.dependencies)?;
        let tasks_json = serde_json::to_string(&job.tasks)?;

        sqlx::query(
            r#"INSERT INTO jobs (
                id, name, repo, revision, patch_json, created_at, finished_at,
                status, is_force, dependencies_json, tasks_json, priority,
                buildbucket_build_id, buildbucket_lease_key, db_modified
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            ON CONFLICT(id) DO UPDATE SET
                finished_at = excluded.finished_at,
                status = excluded.status,
                tasks_json = excluded.tasks_json,
                buildbucket_build_id = excluded.buildbucket_build_id,
                buildbucket_lease_key = excluded.buildbucket_lease_key,
                db_modified = excluded.db_modified"#,
        )
        .bind(job.id.to_string())
        .bind(&job.name)
        .bind(&job.repo_state.repo)
        .bind(&job.repo_state.revision)
        .bind(patch_json)
        .bind(job.created)
        .bind(job.finished)
        .bind(job.status.to_string())
        .bind(job.is_force as i64)
        .bind(deps_json)
        .bind(tasks_json)
        .bind(job.priority)
        .bind(job.buildbucket_build_id)
        .bind(job.buildbucket_lease_key)
        .bind(job.db_modified)
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get_task_by_id(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::task_from_row).transpose()
    }

    async fn get_job_by_id(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn get_tasks_from_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        repo: Option<&str>,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = match repo {
            Some(repo) => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE created_at >= ? AND created_at < ? AND repo = ? ORDER BY created_at ASC",
                )
                .bind(from)
                .bind(to)
                .bind(repo)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE created_at >= ? AND created_at < ? ORDER BY created_at ASC",
                )
                .bind(from)
                .bind(to)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::task_from_row).collect()
    }

    async fn get_jobs_from_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        repo: Option<&str>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = match repo {
            Some(repo) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE created_at >= ? AND created_at < ? AND repo = ? ORDER BY created_at ASC",
                )
                .bind(from)
                .bind(to)
                .bind(repo)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE created_at >= ? AND created_at < ? ORDER BY created_at ASC",
                )
                .bind(from)
                .bind(to)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::job_from_row).collect()
    }
}
