//! Typed error hierarchy for review-pulse.
//!
//! The external collaborators each get their own enum so that retry domains can
//! classify failures by class name:
//! - `FetchError`: review source failures
//! - `ScoreError`: sentiment service failures
//! - `StoreError`: atomic page store failures
//!
//! `StepError` wraps all three for the fetch and score steps, `CheckpointError`
//! covers the durable run store, `ControlError` the control surface and
//! `WorkerError` the process that hosts runs.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::models::RunStatus;

/// Errors from the review source client.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Review source rate limited the request: {0}")]
    RateLimited(String),

    #[error("Review source rejected credentials: {0}")]
    AuthError(String),

    #[error("Review source unavailable: {0}")]
    Unavailable(String),

    #[error("Review source has no such item: {0}")]
    NotFound(String),

    #[error("Review source returned an unreadable page: {0}")]
    MalformedResponse(String),
}

impl FetchError {
    pub fn class(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::AuthError(_) => "auth",
            Self::Unavailable(_) => "unavailable",
            Self::NotFound(_) => "not_found",
            Self::MalformedResponse(_) => "malformed_response",
        }
    }
}

/// Errors from the sentiment scoring client.
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("Sentiment service throttled the request: {0}")]
    Throttled(String),

    #[error("Sentiment service rejected the input: {0}")]
    InvalidInput(String),

    #[error("Sentiment service unavailable: {0}")]
    Unavailable(String),

    #[error("Sentiment service rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Sentiment service returned an unusable response: {0}")]
    MalformedResponse(String),
}

impl ScoreError {
    pub fn class(&self) -> &'static str {
        match self {
            Self::Throttled(_) => "throttled",
            Self::InvalidInput(_) => "invalid_input",
            Self::Unavailable(_) => "unavailable",
            Self::Unauthorized(_) => "unauthorized",
            Self::MalformedResponse(_) => "malformed_response",
        }
    }
}

/// Errors from the atomic page store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Page store unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stored page at {path} is corrupt: {source}")]
    CorruptPayload {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Stored page at {path} is missing")]
    PageMissing { path: PathBuf },
}

impl StoreError {
    pub fn class(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "store_unavailable",
            Self::CorruptPayload { .. } => "corrupt_payload",
            Self::PageMissing { .. } => "page_missing",
        }
    }
}

/// A failure inside the fetch step or the score step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Score(#[from] ScoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Attempt timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl StepError {
    /// Stable class name matched against a retry policy's non-retryable set.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Fetch(e) => e.class(),
            Self::Score(e) => e.class(),
            Self::Store(e) => e.class(),
            Self::Timeout(_) => "timeout",
        }
    }

    /// Errors that no policy may retry: the stored page itself is gone or broken,
    /// so re-running the same step cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::CorruptPayload { .. } | StoreError::PageMissing { .. })
        )
    }
}

/// Errors from the durable checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Iteration for page {page_index} of run {run_id} was already committed")]
    DuplicateIteration { run_id: String, page_index: u64 },

    #[error("Checkpoint row is invalid: {0}")]
    InvalidRow(String),

    #[error("Checkpoint database lock poisoned")]
    LockPoisoned,

    #[error("Checkpoint task panicked: {0}")]
    TaskPanicked(String),
}

/// Errors returned to callers of the control surface.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Cannot {signal} run {run_id}: run is {status}")]
    Conflict {
        run_id: String,
        signal: String,
        status: RunStatus,
    },

    #[error("Run {run_id} is not being driven; it resumes when the worker restarts")]
    RunnerStopped { run_id: String },
}

/// Errors from the worker that hosts runs.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Invalid run parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Errors from the CLI's HTTP client for the worker API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Worker not reachable at {url}: {message}")]
    Unreachable { url: String, message: String },

    #[error("Run {0} not found")]
    NotFound(String),

    #[error("Rejected: {0}")]
    Conflict(String),

    #[error("Worker returned {status}: {message}")]
    Api { status: u16, message: String },
}
