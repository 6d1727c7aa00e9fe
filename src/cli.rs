//! Command-line entry points: `serve` runs the API edge with the embedded
//! worker pool; `gc` sweeps expired artifacts once and exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifacts::{ArtifactStore, FsArtifactStore};
use crate::config::{ArtifactsBackend, Config, RuntimeEnv};
use crate::exports::ExportsStore;
use crate::github::GithubClient;
use crate::queue::InProcessBroker;
use crate::runner::{export_task_handler, RunnerDeps, RunnerLimits};
use crate::server::{self, AppState};

#[derive(Parser)]
#[command(name = "repoexport", version, about = "Repository export service")]
pub struct Cli {
    /// Verbose logging (service-level debug).
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP API with the embedded worker pool and artifact GC.
    Serve,
    /// Delete expired artifact manifests once and exit.
    Gc,
}

/// Parse arguments and dispatch.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    crate::logging::init_tracing(cli.verbose).ok();

    let config = Config::load().context("failed to load configuration")?;
    match cli.command {
        Command::Serve => serve(config).await,
        Command::Gc => gc_once(config),
    }
}

fn build_artifact_store(config: &Config) -> Result<Arc<dyn ArtifactStore>> {
    if config.artifacts_backend == ArtifactsBackend::S3 {
        // The S3 wire client is an external collaborator behind the
        // ObjectClient contract; without one wired in, fall back to the
        // filesystem store rather than refusing to start.
        warn!("s3 artifacts backend has no object client configured; falling back to fs");
    }
    let store = FsArtifactStore::new(&config.artifacts_dir, config.artifacts_ttl_hours)
        .with_context(|| {
            format!(
                "failed to initialize artifacts dir {}",
                config.artifacts_dir.display()
            )
        })?;
    info!(dir = %config.artifacts_dir.display(), ttl_hours = config.artifacts_ttl_hours,
        "artifacts store ready");
    Ok(Arc::new(store))
}

async fn serve(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();

    let artifacts = build_artifact_store(&config)?;
    crate::artifacts::start_gc(
        Arc::clone(&artifacts),
        std::time::Duration::from_secs(5 * 60),
        shutdown.clone(),
    );

    if config.database_url.is_some() {
        warn!("DATABASE_URL is set but no durable exports repository is wired in; running in-memory");
    }
    let exports = Arc::new(ExportsStore::new("exp"));

    let fetcher = Arc::new(
        GithubClient::new(config.github_token.clone())
            .map_err(|e| anyhow::anyhow!("github client init failed: {e}"))?,
    );

    let broker = Arc::new(InProcessBroker::new());
    let deps = Arc::new(RunnerDeps {
        fetcher,
        artifacts: Arc::clone(&artifacts),
        exports: Arc::clone(&exports),
        max_attempts: 3,
        limits: RunnerLimits::default(),
    });
    broker.start_workers(
        config.worker_concurrency,
        &config.worker_queues,
        export_task_handler(deps),
        shutdown.clone(),
    );

    let state = AppState {
        exports,
        artifacts,
        broker,
        request_timeout: config.request_timeout,
        cors_allow_all: config.env != RuntimeEnv::Prod,
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, workers = config.worker_concurrency, "repoexport listening");

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            server_shutdown.cancel();
        }
    });

    server::serve(state, listener, shutdown).await
}

fn gc_once(config: Config) -> Result<()> {
    let store = FsArtifactStore::new(&config.artifacts_dir, config.artifacts_ttl_hours)
        .context("failed to open artifacts dir")?;
    store.gc_once();
    info!(dir = %config.artifacts_dir.display(), "artifact gc sweep finished");
    Ok(())
}
