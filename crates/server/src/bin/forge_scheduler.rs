use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use forge_core_db::SqliteStore;
use forge_core_executors::{FakeExecutionService, FakeReviewServiceClient, FakeTaskConfigReader, InMemoryIsolateClient, InMemoryRepoGraph};
use forge_core_local_deployment::{FilesystemDiagnosticsSink, LocalDeployment};
use forge_core_server::routes;
use forge_core_utils::config::SchedulerConfig;
use tokio::net::TcpListener;

/// Runs the Forge scheduler: the C10 main loop plus its periodic tasks
/// and an HTTP diagnostics surface.
#[derive(Debug, Parser)]
struct Cli {
    /// Path to a SchedulerConfig TOML file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Repo to schedule for; repeatable.
    #[arg(long = "repo", required = true)]
    repos: Vec<String>,

    /// Bot-pool dimension set (comma-separated "key:value" pairs);
    /// repeatable. Defaults to one pool with no dimension filter.
    #[arg(long = "pool")]
    pools: Vec<String>,

    #[arg(long)]
    http_bind_addr: Option<String>,

    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    forge_core_utils::logging::init_tracing();

    let cli = Cli::parse();
    let mut config = SchedulerConfig::load(cli.config.as_deref()).context("loading scheduler config")?;
    if let Some(addr) = cli.http_bind_addr {
        config.http_bind_addr = addr;
    }
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let store = SqliteStore::connect(&config.database_url).await.context("connecting to the store")?;
    store.migrate().await.context("running store migrations")?;

    let pools = if cli.pools.is_empty() {
        vec![Vec::new()]
    } else {
        cli.pools.iter().map(|p| p.split(',').map(str::to_string).collect()).collect()
    };

    // The execution service, review service, task-config reader and
    // isolate store are external collaborators out of this system's
    // scope (spec.md §1/§6); only the persistent store is real.
    let deployment = Arc::new(LocalDeployment::new(
        Arc::new(store),
        Arc::new(InMemoryRepoGraph::new()),
        Arc::new(FakeExecutionService::new()),
        Arc::new(InMemoryIsolateClient::new()),
        Arc::new(FakeReviewServiceClient::new()),
        Arc::new(FakeTaskConfigReader::default()),
        Arc::new(FilesystemDiagnosticsSink::new(config.data_dir.clone())),
        config.clone(),
        cli.repos,
        pools,
    ));

    let handles = deployment.spawn_background_tasks();

    let listener = TcpListener::bind(&config.http_bind_addr).await.context("binding http listener")?;
    tracing::info!(addr = %config.http_bind_addr, "forge scheduler listening");
    axum::serve(listener, routes::router(deployment)).await.context("serving http")?;

    for handle in handles {
        handle.abort();
    }
    Ok(())
}
