//! Worker process: storage wiring, run recovery and the HTTP listener.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use fs2::FileExt;

use crate::api::{self, AppState, SharedState};
use crate::checkpoint::{CheckpointDb, CheckpointHandle};
use crate::config::PulseConfig;
use crate::orchestrator::RunEnvironment;
use crate::page_store::FilePageStore;
use crate::retry::RetryDomain;
use crate::scoring::http::HttpSentimentScorer;
use crate::source::HttpReviewSource;
use crate::worker::Worker;

/// Exclusive hold on a data directory. Released when dropped.
#[derive(Debug)]
pub struct WorkerLock {
    _file: File,
    path: PathBuf,
}

impl WorkerLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;
        file.try_lock_exclusive().with_context(|| {
            format!(
                "Another worker already owns this data directory (lock: {})",
                path.display()
            )
        })?;
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Wire the HTTP clients, page store, checkpoint DB and retry domains for a worker.
pub fn build_environment(config: &PulseConfig) -> Result<Arc<RunEnvironment>> {
    let toml = &config.toml;
    let api_base = toml
        .source
        .api_base
        .as_deref()
        .context("source.api_base is not configured (set it in pulse.toml or PULSE_SOURCE_API_BASE)")?;
    let endpoint = toml
        .scoring
        .endpoint
        .as_deref()
        .context("scoring.endpoint is not configured (set it in pulse.toml or PULSE_SCORING_ENDPOINT)")?;

    let source = HttpReviewSource::new(
        api_base,
        &toml.source.headers(),
        Duration::from_secs(toml.source.timeout_secs),
    )
    .context("Failed to build review source client")?;
    let scorer = HttpSentimentScorer::new(
        endpoint,
        toml.scoring.api_key.as_deref(),
        Duration::from_secs(toml.scoring.timeout_secs),
        toml.scoring.batch_size,
    )
    .context("Failed to build sentiment scorer client")?;

    let db = CheckpointDb::new(&config.checkpoint_db())
        .context("Failed to initialize checkpoint database")?;

    Ok(Arc::new(RunEnvironment {
        source: Arc::new(source),
        scorer: Arc::new(scorer),
        pages: Arc::new(FilePageStore::new(config.pages_dir())),
        checkpoints: CheckpointHandle::new(db),
        fetch_domain: RetryDomain::new("fetch", toml.fetch_policy()),
        score_domain: RetryDomain::new("score", toml.score_policy()),
        max_text_bytes: toml.scoring.max_text_bytes,
    }))
}

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Serve the API on `listener` until `shutdown` resolves, then stop hosted runs.
pub async fn serve<F>(listener: tokio::net::TcpListener, worker: Arc<Worker>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(Arc::new(AppState {
        worker: worker.clone(),
    }));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error");
    worker.shutdown();
    served
}

/// Start the worker: lock the data directory, recover unfinished runs, serve the API.
pub async fn start_worker(config: &PulseConfig) -> Result<()> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    let lock = WorkerLock::acquire(&config.lock_file())?;
    tracing::debug!(lock = %lock.path().display(), "acquired worker lock");

    let env = build_environment(config)?;
    let worker = Worker::new(env, config.toml.run_defaults());
    let recovered = worker
        .recover()
        .await
        .context("Failed to recover unfinished runs")?;
    if recovered > 0 {
        tracing::info!(recovered, "resumed unfinished runs");
    }

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, data_dir = %data_dir.display(), "worker listening");
    println!("review-pulse worker running at http://{}", local_addr);

    serve(listener, worker, shutdown_signal()).await?;

    println!("Worker shut down gracefully.");
    drop(lock);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
