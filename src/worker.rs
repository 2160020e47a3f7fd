//! The worker hosts runs: it starts new ones, recovers unfinished ones after a
//! restart, and routes queries and signals to the right run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::checkpoint::RunRecord;
use crate::errors::{ControlError, WorkerError};
use crate::models::{Progress, RunParams, RunSummary, WeightPolicy};
use crate::orchestrator::{ControlHandle, ControlSignal, PaginationRunner, RunEnvironment, SignalAck};
use crate::retry::DomainStatsSnapshot;
use crate::source::segment_url;

/// Values used when a start request leaves a field out.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDefaults {
    pub max_records: u64,
    pub page_size: u32,
    pub weight_policy: WeightPolicy,
    pub language_code: String,
    pub product_url_base: Option<String>,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            max_records: 1000,
            page_size: 10,
            weight_policy: WeightPolicy::Uniform,
            language_code: "en".to_string(),
            product_url_base: None,
        }
    }
}

/// Body of `POST /api/runs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRun {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_records: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_policy: Option<WeightPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
}

impl StartRun {
    fn into_params(self, defaults: &RunDefaults) -> Result<RunParams, WorkerError> {
        let source_id = self.source_id.trim().to_string();
        if source_id.is_empty() {
            return Err(WorkerError::InvalidParams("source_id must not be empty".into()));
        }
        if source_id.contains('/') {
            return Err(WorkerError::InvalidParams(format!(
                "source_id '{}' must not contain '/'",
                source_id
            )));
        }
        let page_size = self.page_size.unwrap_or(defaults.page_size);
        if page_size == 0 {
            return Err(WorkerError::InvalidParams("page_size must be at least 1".into()));
        }
        let language_code = self
            .language_code
            .unwrap_or_else(|| defaults.language_code.clone());
        if language_code.trim().is_empty() {
            return Err(WorkerError::InvalidParams("language_code must not be empty".into()));
        }
        let product_url = defaults
            .product_url_base
            .as_deref()
            .and_then(|base| reqwest::Url::parse(base).ok())
            .filter(|base| !base.cannot_be_a_base())
            .map(|base| segment_url(&base, &[source_id.as_str()]).to_string());
        Ok(RunParams {
            source_id,
            max_records: self.max_records.unwrap_or(defaults.max_records),
            page_size,
            weight_policy: self.weight_policy.unwrap_or(defaults.weight_policy),
            language_code,
            product_url,
        })
    }
}

/// Per-domain retry counters, as reported by `/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryReport {
    pub fetch: DomainStatsSnapshot,
    pub score: DomainStatsSnapshot,
}

struct HostedRun {
    /// Distinguishes this hosting from a later re-host of the same run.
    epoch: u64,
    handle: ControlHandle,
    task: JoinHandle<()>,
}

type RunMap = Arc<Mutex<HashMap<String, HostedRun>>>;

fn lock_runs(runs: &RunMap) -> MutexGuard<'_, HashMap<String, HostedRun>> {
    // Entries are replaced whole, so a poisoned map is still consistent.
    runs.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Worker {
    env: Arc<RunEnvironment>,
    defaults: RunDefaults,
    runs: RunMap,
    next_epoch: AtomicU64,
}

impl Worker {
    pub fn new(env: Arc<RunEnvironment>, defaults: RunDefaults) -> Arc<Self> {
        Arc::new(Self {
            env,
            defaults,
            runs: Arc::new(Mutex::new(HashMap::new())),
            next_epoch: AtomicU64::new(0),
        })
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, HostedRun>> {
        lock_runs(&self.runs)
    }

    /// Handle of a run this worker is still driving, or has driven to the end.
    fn handle(&self, run_id: &str) -> Option<ControlHandle> {
        self.runs()
            .get(run_id)
            .map(|run| run.handle.clone())
            .filter(|handle| handle.is_live() || handle.status().is_terminal())
    }

    /// Host a run from its last committed record.
    fn host(&self, record: RunRecord) -> ControlHandle {
        let (runner, handle) = PaginationRunner::new(self.env.clone(), record);
        let run_id = runner.run_id().to_string();
        let pages = self.env.pages.clone();
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let runs = self.runs.clone();

        // Held across the spawn so the task cannot unregister before it is
        // registered.
        let mut hosted = self.runs();
        let task_run_id = run_id.clone();
        let task = tokio::spawn(async move {
            match runner.run().await {
                Ok(progress) => {
                    match pages.purge_run(&task_run_id).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(run_id = %task_run_id, pages = n, "purged leftover pages"),
                        Err(e) => tracing::warn!(run_id = %task_run_id, "failed to purge pages: {}", e),
                    }
                    tracing::debug!(run_id = %task_run_id, status = %progress.status, "run task done");
                }
                Err(e) => {
                    tracing::error!(
                        run_id = %task_run_id,
                        "run stopped on checkpoint error, will resume on restart: {}",
                        e
                    );
                    let mut hosted = lock_runs(&runs);
                    if hosted.get(&task_run_id).is_some_and(|run| run.epoch == epoch) {
                        hosted.remove(&task_run_id);
                    }
                }
            }
        });

        hosted.insert(
            run_id,
            HostedRun {
                epoch,
                handle: handle.clone(),
                task,
            },
        );
        handle
    }

    fn stopped(run_id: &str) -> WorkerError {
        WorkerError::Control(ControlError::RunnerStopped {
            run_id: run_id.to_string(),
        })
    }

    pub async fn start_run(&self, request: StartRun) -> Result<Progress, WorkerError> {
        let params = request.into_params(&self.defaults)?;
        let run_id = uuid::Uuid::new_v4().to_string();

        let id = run_id.clone();
        let record = self
            .env
            .checkpoints
            .call(move |db| db.create_run(&id, &params))
            .await?;
        tracing::info!(
            %run_id,
            source_id = %record.params.source_id,
            max_records = record.params.max_records,
            weight_policy = %record.params.weight_policy,
            "run created"
        );
        Ok(self.host(record).progress())
    }

    /// Re-host every run that was Running or Paused when the worker last stopped.
    pub async fn recover(&self) -> Result<usize, WorkerError> {
        let records = self.env.checkpoints.call(|db| db.list_resumable()).await?;
        let count = records.len();
        for record in records {
            if self.handle(&record.run_id).is_some() {
                continue;
            }
            tracing::info!(
                run_id = %record.run_id,
                status = %record.state.status,
                cursor = record.state.cursor,
                "recovering run"
            );
            self.host(record);
        }
        Ok(count)
    }

    pub async fn progress(&self, run_id: &str) -> Result<Progress, WorkerError> {
        if let Some(handle) = self.handle(run_id) {
            return Ok(handle.progress());
        }
        let id = run_id.to_string();
        let record = self.env.checkpoints.call(move |db| db.get_run(&id)).await?;
        record
            .map(|r| r.progress())
            .ok_or_else(|| WorkerError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    pub async fn signal(&self, run_id: &str, signal: ControlSignal) -> Result<SignalAck, WorkerError> {
        if let Some(handle) = self.handle(run_id) {
            let ack = handle.signal(signal)?;
            tracing::info!(run_id, signal = signal.as_str(), ?ack, "signal posted");
            return Ok(ack);
        }
        // Not hosted here: either finished before this worker started, or its
        // runner stopped on a checkpoint error.
        let progress = self.progress(run_id).await?;
        if progress.status.is_terminal() {
            Ok(SignalAck::NoOp)
        } else {
            Err(Self::stopped(run_id))
        }
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<RunSummary>, WorkerError> {
        Ok(self.env.checkpoints.call(move |db| db.list_runs(limit)).await?)
    }

    /// Wait for a hosted run to finish.
    pub async fn wait(&self, run_id: &str) -> Result<Progress, WorkerError> {
        match self.handle(run_id) {
            Some(mut handle) => Ok(handle.wait_terminal().await?),
            None => {
                let progress = self.progress(run_id).await?;
                if progress.status.is_terminal() {
                    Ok(progress)
                } else {
                    Err(Self::stopped(run_id))
                }
            }
        }
    }

    pub fn active_runs(&self) -> usize {
        self.runs()
            .values()
            .filter(|run| !run.task.is_finished() && run.handle.is_live())
            .count()
    }

    pub fn retry_report(&self) -> RetryReport {
        RetryReport {
            fetch: self.env.fetch_domain.stats(),
            score: self.env.score_domain.stats(),
        }
    }

    /// Stop every run task. Each run resumes from its last commit next time.
    pub fn shutdown(&self) {
        let runs = self.runs();
        for (run_id, run) in runs.iter() {
            if !run.task.is_finished() {
                tracing::info!(%run_id, "stopping run for shutdown");
                run.task.abort();
            }
        }
    }
}
