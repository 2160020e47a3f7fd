//! HTTP control API served by the worker.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::errors::{ControlError, WorkerError};
use crate::models::RunStatus;
use crate::orchestrator::{ControlSignal, SignalAck};
use crate::worker::{RetryReport, StartRun, Worker};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub worker: Arc<Worker>,
}

pub type SharedState = Arc<AppState>;

// ── Payload types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

/// Reply to a pause/resume/cancel request.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignalResponse {
    pub run_id: String,
    pub signal: ControlSignal,
    pub result: SignalAck,
    pub status: RunStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_runs: usize,
    pub retry: RetryReport,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<WorkerError> for ApiError {
    fn from(err: WorkerError) -> Self {
        let msg = err.to_string();
        match err {
            WorkerError::RunNotFound { .. } => ApiError::NotFound(msg),
            WorkerError::InvalidParams(_) => ApiError::BadRequest(msg),
            WorkerError::Control(ControlError::Conflict { .. }) => ApiError::Conflict(msg),
            WorkerError::Control(ControlError::RunnerStopped { .. }) => {
                tracing::warn!("request for a stopped run: {}", msg);
                ApiError::Internal(msg)
            }
            WorkerError::Checkpoint(_) => {
                tracing::error!("checkpoint error serving request: {}", msg);
                ApiError::Internal(msg)
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

const DEFAULT_LIST_LIMIT: usize = 20;

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/runs", get(list_runs).post(start_run))
        .route("/api/runs/{id}", get(get_progress))
        .route("/api/runs/{id}/pause", post(pause_run))
        .route("/api/runs/{id}/resume", post(resume_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_runs: state.worker.active_runs(),
        retry: state.worker.retry_report(),
    })
}

async fn list_runs(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let runs = state.worker.list(limit).await?;
    Ok(Json(runs))
}

async fn start_run(
    State(state): State<SharedState>,
    Json(request): Json<StartRun>,
) -> Result<impl IntoResponse, ApiError> {
    let progress = state.worker.start_run(request).await?;
    Ok((StatusCode::CREATED, Json(progress)))
}

async fn get_progress(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let progress = state.worker.progress(&id).await?;
    Ok(Json(progress))
}

async fn send_signal(
    state: &SharedState,
    id: String,
    signal: ControlSignal,
) -> Result<Json<SignalResponse>, ApiError> {
    let result = state.worker.signal(&id, signal).await?;
    let status = state.worker.progress(&id).await?.status;
    Ok(Json(SignalResponse {
        run_id: id,
        signal,
        result,
        status,
    }))
}

async fn pause_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    send_signal(&state, id, ControlSignal::Pause).await
}

async fn resume_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    send_signal(&state, id, ControlSignal::Resume).await
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    send_signal(&state, id, ControlSignal::Cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Progress, RunSummary};
    use crate::source::testing::ScriptedSource;
    use crate::worker::testing::worker;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_app(source: ScriptedSource) -> (Router, Arc<Worker>) {
        let worker = worker(source);
        let state = Arc::new(AppState {
            worker: worker.clone(),
        });
        (api_router().with_state(state), worker)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_stopped_runner_maps_to_500() {
        let err = WorkerError::Control(ControlError::RunnerStopped {
            run_id: "r1".into(),
        });
        let resp = ApiError::from(err).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app(ScriptedSource::uniform(1, 1));
        let resp = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_runs"], 0);
        assert_eq!(body["retry"]["fetch"]["attempts"], 0);
    }

    #[tokio::test]
    async fn test_start_run_and_query_progress() {
        let (app, worker) = test_app(ScriptedSource::uniform(3, 10));
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/runs",
                serde_json::json!({"source_id": "item-7", "max_records": 15}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let started: Progress = body_json(resp.into_body()).await;
        assert_eq!(started.source_id, "item-7");
        assert_eq!(started.max_records, 15);

        worker.wait(&started.run_id).await.unwrap();

        let resp = app
            .clone()
            .oneshot(get(&format!("/api/runs/{}", started.run_id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let progress: Progress = body_json(resp.into_body()).await;
        assert_eq!(progress.status, RunStatus::Completed);
        assert_eq!(progress.records_processed, 15);
        assert_eq!(progress.average, Some(1.0));

        let resp = app.oneshot(get("/api/runs?limit=5")).await.unwrap();
        let runs: Vec<RunSummary> = body_json(resp.into_body()).await;
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_start_run_invalid_params_is_400() {
        let (app, _) = test_app(ScriptedSource::uniform(1, 1));
        let resp = app
            .oneshot(post_json(
                "/api/runs",
                serde_json::json!({"source_id": "x", "page_size": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("page_size"));
    }

    #[tokio::test]
    async fn test_unknown_run_is_404() {
        let (app, _) = test_app(ScriptedSource::uniform(1, 1));
        let resp = app.clone().oneshot(get("/api/runs/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = app.oneshot(post_empty("/api/runs/nope/pause")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_signals_on_completed_run_are_noops() {
        let (app, worker) = test_app(ScriptedSource::uniform(1, 3));
        let started = worker
            .start_run(StartRun {
                source_id: "item-1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        worker.wait(&started.run_id).await.unwrap();

        for action in ["pause", "resume", "cancel"] {
            let resp = app
                .clone()
                .oneshot(post_empty(&format!("/api/runs/{}/{}", started.run_id, action)))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "{}", action);
            let body: SignalResponse = body_json(resp.into_body()).await;
            assert_eq!(body.result, SignalAck::NoOp);
            assert_eq!(body.status, RunStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_resume_running_run_is_409() {
        use crate::checkpoint::{CheckpointDb, CheckpointHandle};
        use crate::retry::{RetryDomain, RetryPolicy};
        use crate::worker::RunDefaults;
        use crate::worker::testing::{environment, fast_policy};
        use std::time::Duration;

        // The first page keeps failing and each retry backs off for a minute.
        let source = ScriptedSource::uniform(1, 10).fail_page(
            1,
            (0..10)
                .map(|_| crate::errors::FetchError::Unavailable("503".into()))
                .collect(),
        );
        let mut env = environment(
            source,
            CheckpointHandle::new(CheckpointDb::new_in_memory().unwrap()),
        );
        Arc::get_mut(&mut env).unwrap().fetch_domain = RetryDomain::new(
            "fetch",
            RetryPolicy {
                initial_interval: Duration::from_secs(60),
                maximum_interval: Duration::from_secs(60),
                ..fast_policy()
            },
        );
        let worker = Worker::new(env, RunDefaults::default());
        let app = api_router().with_state(Arc::new(AppState {
            worker: worker.clone(),
        }));
        let started = worker
            .start_run(StartRun {
                source_id: "item-1".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let resp = app
            .clone()
            .oneshot(post_empty(&format!("/api/runs/{}/resume", started.run_id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("running"));

        let resp = app
            .oneshot(post_empty(&format!("/api/runs/{}/cancel", started.run_id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: SignalResponse = body_json(resp.into_body()).await;
        assert_eq!(body.result, SignalAck::Accepted);

        let done = worker.wait(&started.run_id).await.unwrap();
        assert_eq!(done.status, RunStatus::Cancelled);
    }
}
