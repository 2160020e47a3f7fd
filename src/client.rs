//! HTTP client for the worker's control API, used by the CLI commands.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::api::{HealthResponse, SignalResponse};
use crate::errors::ClientError;
use crate::models::{Progress, RunSummary};
use crate::orchestrator::ControlSignal;
use crate::worker::StartRun;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct WorkerClient {
    client: reqwest::Client,
    base_url: String,
}

impl WorkerClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Unreachable {
                url: base_url.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn unreachable(&self, err: reqwest::Error) -> ClientError {
        ClientError::Unreachable {
            url: self.base_url.clone(),
            message: err.to_string(),
        }
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        resp: reqwest::Response,
        run_id: Option<&str>,
    ) -> Result<T, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return resp.json::<T>().await.map_err(|e| ClientError::Api {
                status: status.as_u16(),
                message: format!("unexpected response body: {}", e),
            });
        }

        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or(body);
        match status {
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(
                run_id.map(String::from).unwrap_or(message),
            )),
            StatusCode::CONFLICT => Err(ClientError::Conflict(message)),
            _ => Err(ClientError::Api {
                status: status.as_u16(),
                message,
            }),
        }
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let resp = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.decode(resp, None).await
    }

    pub async fn start_run(&self, request: &StartRun) -> Result<Progress, ClientError> {
        let resp = self
            .client
            .post(self.url("/api/runs"))
            .json(request)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.decode(resp, None).await
    }

    pub async fn progress(&self, run_id: &str) -> Result<Progress, ClientError> {
        let resp = self
            .client
            .get(self.url(&format!("/api/runs/{}", run_id)))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.decode(resp, Some(run_id)).await
    }

    pub async fn signal(
        &self,
        run_id: &str,
        signal: ControlSignal,
    ) -> Result<SignalResponse, ClientError> {
        let resp = self
            .client
            .post(self.url(&format!("/api/runs/{}/{}", run_id, signal.as_str())))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.decode(resp, Some(run_id)).await
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<RunSummary>, ClientError> {
        let resp = self
            .client
            .get(self.url("/api/runs"))
            .query(&[("limit", limit)])
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.decode(resp, None).await
    }
}
