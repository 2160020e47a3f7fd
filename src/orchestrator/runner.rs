//! The pagination state machine.
//!
//! One `PaginationRunner` drives one run: fetch and store a page inside the
//! fetch retry domain, score it inside the score retry domain, fold the scores,
//! drop the stored page, and commit. Signals are applied only between pages,
//! so no page is ever half-folded.

use std::sync::Arc;

use tokio::sync::watch;

use super::control::{ControlHandle, ControlSignal, Mailbox};
use crate::aggregate::AggregateState;
use crate::checkpoint::{CheckpointHandle, RunRecord};
use crate::errors::{CheckpointError, StepError};
use crate::models::{
    PageRequest, PageSummary, Progress, RunFailure, RunParams, RunStatus, ScoreBatch,
    SourceMeta, StepKind,
};
use crate::page_store::{PageLocation, PageStore};
use crate::retry::{RetryDomain, RetryError};
use crate::scoring::{SentimentScorer, score_page};
use crate::source::ReviewSource;

/// Everything a run talks to. Shared by all runs in a worker.
#[derive(Clone)]
pub struct RunEnvironment {
    pub source: Arc<dyn ReviewSource>,
    pub scorer: Arc<dyn SentimentScorer>,
    pub pages: Arc<dyn PageStore>,
    pub checkpoints: CheckpointHandle,
    pub fetch_domain: RetryDomain,
    pub score_domain: RetryDomain,
    pub max_text_bytes: usize,
}

enum StepOutcome<T> {
    Done(T),
    /// The run left Running (failed or cancelled) and the change is committed.
    Stopped,
}

pub struct PaginationRunner {
    env: Arc<RunEnvironment>,
    run_id: String,
    params: RunParams,
    state: AggregateState,
    meta: SourceMeta,
    failure: Option<RunFailure>,
    mailbox: Arc<Mailbox>,
    progress_tx: watch::Sender<Progress>,
}

impl PaginationRunner {
    /// Build a runner from the last committed record, fresh or recovered.
    pub fn new(env: Arc<RunEnvironment>, record: RunRecord) -> (Self, ControlHandle) {
        let mailbox = Arc::new(Mailbox::new());
        let (progress_tx, progress_rx) = watch::channel(record.progress());
        let handle = ControlHandle::new(record.run_id.clone(), mailbox.clone(), progress_rx);
        let runner = Self {
            env,
            run_id: record.run_id,
            params: record.params,
            state: record.state,
            meta: record.meta,
            failure: record.failure,
            mailbox,
            progress_tx,
        };
        (runner, handle)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn snapshot(&self) -> Progress {
        Progress {
            run_id: self.run_id.clone(),
            source_id: self.params.source_id.clone(),
            status: self.state.status,
            cursor: self.state.cursor,
            pages_processed: self.state.pages_processed,
            records_processed: self.state.records_processed,
            records_skipped: self.state.records_skipped,
            total_weight: self.state.total_weight,
            average: self.state.average(),
            max_records: self.state.max_records,
            total_known: self.meta.total_known,
            product_name: self.meta.product_name.clone(),
            sale_price: self.meta.sale_price,
            product_url: self.params.product_url.clone(),
            failure: self.failure.clone(),
        }
    }

    fn publish(&self) {
        self.progress_tx.send_replace(self.snapshot());
    }

    /// Drive the run until it reaches a terminal status. Step failures end the
    /// run as Failed; only checkpoint errors are returned, and they leave the
    /// run resumable from its last commit.
    pub async fn run(mut self) -> Result<Progress, CheckpointError> {
        tracing::info!(
            run_id = %self.run_id,
            source_id = %self.params.source_id,
            cursor = self.state.cursor,
            status = %self.state.status,
            "run started"
        );

        while !self.state.status.is_terminal() {
            if let Some(signal) = self.mailbox.take() {
                self.apply_signal(signal).await?;
                continue;
            }

            if self.state.status == RunStatus::Paused {
                let signal = self.mailbox.recv().await;
                self.apply_signal(signal).await?;
                continue;
            }

            if self.state.limit_reached() {
                self.transition(RunStatus::Completed).await?;
                break;
            }

            self.iterate().await?;
        }

        tracing::info!(
            run_id = %self.run_id,
            status = %self.state.status,
            pages = self.state.pages_processed,
            records = self.state.records_processed,
            average = ?self.state.average(),
            "run finished"
        );
        Ok(self.snapshot())
    }

    async fn apply_signal(&mut self, signal: ControlSignal) -> Result<(), CheckpointError> {
        let next = match (signal, self.state.status) {
            (ControlSignal::Cancel, _) => RunStatus::Cancelled,
            (ControlSignal::Pause, RunStatus::Running) => RunStatus::Paused,
            (ControlSignal::Resume, RunStatus::Paused) => RunStatus::Running,
            (signal, status) => {
                tracing::debug!(run_id = %self.run_id, signal = signal.as_str(), %status, "signal ignored");
                return Ok(());
            }
        };
        tracing::info!(run_id = %self.run_id, signal = signal.as_str(), "applying signal");
        self.transition(next).await
    }

    /// Persist a status change, then make it visible to queries.
    async fn transition(&mut self, status: RunStatus) -> Result<(), CheckpointError> {
        let run_id = self.run_id.clone();
        let failure = self.failure.clone();
        self.env
            .checkpoints
            .call(move |db| db.save_status(&run_id, status, failure.as_ref()))
            .await?;
        self.state.status = status;
        self.publish();
        Ok(())
    }

    async fn fail(
        &mut self,
        step: StepKind,
        page_index: u64,
        error: StepError,
        attempts: u32,
    ) -> Result<(), CheckpointError> {
        tracing::error!(
            run_id = %self.run_id,
            %step,
            page_index,
            attempts,
            class = error.class(),
            "step failed: {}",
            error
        );
        self.failure = Some(RunFailure {
            step,
            page_index,
            error_class: error.class().to_string(),
            message: error.to_string(),
            attempts,
        });
        self.transition(RunStatus::Failed).await
    }

    async fn stop<T>(
        &mut self,
        step: StepKind,
        page_index: u64,
        error: RetryError,
    ) -> Result<StepOutcome<T>, CheckpointError> {
        match error {
            RetryError::Failed {
                error, attempts, ..
            } => self.fail(step, page_index, error, attempts).await?,
            RetryError::Interrupted { .. } => {
                self.mailbox.take();
                self.transition(RunStatus::Cancelled).await?;
            }
        }
        Ok(StepOutcome::Stopped)
    }

    /// Fetch the page and put it in the store, as one retried step.
    async fn fetch_step(
        &mut self,
        request: PageRequest,
    ) -> Result<StepOutcome<(PageLocation, PageSummary)>, CheckpointError> {
        let env = self.env.clone();
        let run_id = self.run_id.clone();
        let page_index = request.page_index;

        let result = env
            .fetch_domain
            .run(&self.mailbox, |attempt| {
                let env = env.clone();
                let run_id = run_id.clone();
                let request = request.clone();
                async move {
                    tracing::debug!(%run_id, page_index = request.page_index, attempt, "fetching page");
                    let page = env.source.fetch_page(&request).await?;
                    let location = env.pages.put(&run_id, request.page_index, &page).await?;
                    Ok::<_, StepError>((location, PageSummary::from(&page)))
                }
            })
            .await;

        match result {
            Ok(done) => Ok(StepOutcome::Done(done)),
            Err(e) => self.stop(StepKind::Fetch, page_index, e).await,
        }
    }

    /// Read the stored page back and score at most `limit` of its records.
    async fn score_step(
        &mut self,
        location: PageLocation,
        limit: u64,
    ) -> Result<StepOutcome<ScoreBatch>, CheckpointError> {
        let env = self.env.clone();
        let policy = self.params.weight_policy;
        let language = self.params.language_code.clone();
        let page_index = location.page_index;

        let result = env
            .score_domain
            .run(&self.mailbox, |attempt| {
                let env = env.clone();
                let location = location.clone();
                let language = language.clone();
                async move {
                    tracing::debug!(page_index = location.page_index, attempt, "scoring page");
                    let page = env.pages.get(&location).await?;
                    let batch = score_page(
                        env.scorer.as_ref(),
                        &page.records,
                        limit,
                        policy,
                        env.max_text_bytes,
                        &language,
                    )
                    .await?;
                    Ok::<_, StepError>(batch)
                }
            })
            .await;

        match result {
            Ok(batch) => Ok(StepOutcome::Done(batch)),
            Err(e) => self.stop(StepKind::Score, page_index, e).await,
        }
    }

    /// One page, start to commit. A crash anywhere before the commit replays
    /// this whole iteration from the same cursor.
    async fn iterate(&mut self) -> Result<(), CheckpointError> {
        let page_index = self.state.cursor;
        let request = PageRequest {
            source_id: self.params.source_id.clone(),
            page_index,
            page_size: self.params.page_size,
        };

        let (location, summary) = match self.fetch_step(request).await? {
            StepOutcome::Done(fetched) => fetched,
            StepOutcome::Stopped => return Ok(()),
        };

        // Metadata from the first page becomes visible with that page's commit.
        let meta = if self.state.pages_processed == 0 {
            SourceMeta {
                product_name: summary.product_name.clone(),
                sale_price: summary.sale_price,
                total_known: summary.total_known,
            }
        } else {
            self.meta.clone()
        };

        let batch = if summary.record_count == 0 {
            ScoreBatch::default()
        } else {
            match self.score_step(location.clone(), self.state.remaining()).await? {
                StepOutcome::Done(batch) => batch,
                StepOutcome::Stopped => return Ok(()),
            }
        };

        let delta = self.state.fold(page_index, &batch);

        if let Err(e) = self.env.pages.delete(&location).await {
            tracing::warn!(run_id = %self.run_id, page_index, "failed to delete stored page: {}", e);
        }

        self.state.cursor = page_index + 1;
        if !summary.has_more || self.state.limit_reached() {
            self.state.status = RunStatus::Completed;
        }

        let run_id = self.run_id.clone();
        let state = self.state.clone();
        let committed_meta = meta.clone();
        let has_more = summary.has_more;
        let committed = delta.clone();
        self.env
            .checkpoints
            .call(move |db| {
                db.commit_iteration(&run_id, &committed, has_more, &state, &committed_meta)
            })
            .await?;
        self.meta = meta;
        self.publish();

        tracing::info!(
            run_id = %self.run_id,
            page_index,
            records = delta.records,
            skipped = delta.skipped,
            total = self.state.records_processed,
            average = ?self.state.average(),
            "page committed"
        );
        Ok(())
    }
}
