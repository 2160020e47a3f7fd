//! HTTP client for the sentiment scoring service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use super::{SentimentScorer, SentimentScores};
use crate::errors::ScoreError;

/// Largest number of texts the service accepts per request.
pub const MAX_BATCH_SIZE: usize = 25;

#[derive(Serialize)]
struct BatchRequest<'a> {
    language_code: &'a str,
    texts: &'a [String],
}

#[derive(Deserialize)]
struct BatchResponse {
    results: Vec<SentimentScores>,
}

#[derive(Clone)]
pub struct HttpSentimentScorer {
    client: reqwest::Client,
    endpoint: String,
    batch_size: usize,
}

impl HttpSentimentScorer {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        timeout: Duration,
        batch_size: usize,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key.map(str::trim).filter(|k| !k.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| anyhow::anyhow!("invalid scoring API key: {}", e))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/sentiment/batch", base_url.trim_end_matches('/')),
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
        })
    }

    async fn send_batch(
        &self,
        texts: &[String],
        language_code: &str,
    ) -> Result<Vec<SentimentScores>, ScoreError> {
        let request = BatchRequest {
            language_code,
            texts,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| ScoreError::Unavailable(format!("request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(status, body));
        }

        let parsed: BatchResponse = resp
            .json()
            .await
            .map_err(|e| ScoreError::MalformedResponse(format!("unreadable body: {}", e)))?;
        if parsed.results.len() != texts.len() {
            return Err(ScoreError::MalformedResponse(format!(
                "service returned {} results for {} texts",
                parsed.results.len(),
                texts.len()
            )));
        }
        Ok(parsed.results)
    }
}

fn classify_status(status: StatusCode, body: String) -> ScoreError {
    let detail = format!("{}: {}", status, body);
    match status {
        StatusCode::TOO_MANY_REQUESTS => ScoreError::Throttled(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ScoreError::Unauthorized(detail),
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::UNPROCESSABLE_ENTITY => {
            ScoreError::InvalidInput(detail)
        }
        s if s.is_server_error() => ScoreError::Unavailable(detail),
        _ => ScoreError::MalformedResponse(detail),
    }
}

#[async_trait]
impl SentimentScorer for HttpSentimentScorer {
    async fn score_batch(
        &self,
        texts: &[String],
        language_code: &str,
    ) -> Result<Vec<SentimentScores>, ScoreError> {
        let mut results = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            results.extend(self.send_batch(batch, language_code).await?);
        }
        tracing::debug!(texts = texts.len(), "scored texts");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    async fn spawn_service(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn scorer(base: &str) -> HttpSentimentScorer {
        HttpSentimentScorer::new(base, Some("test-key"), Duration::from_secs(5), 25).unwrap()
    }

    #[tokio::test]
    async fn test_batches_of_at_most_25() {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let seen = sizes.clone();
        let router = Router::new().route(
            "/sentiment/batch",
            post(move |Json(body): Json<serde_json::Value>| {
                let seen = seen.clone();
                async move {
                    let n = body["texts"].as_array().unwrap().len();
                    seen.lock().unwrap().push(n);
                    let results: Vec<_> = (0..n)
                        .map(|_| serde_json::json!({"positive": 1.0, "negative": 0.0}))
                        .collect();
                    Json(serde_json::json!({ "results": results }))
                }
            }),
        );
        let base = spawn_service(router).await;

        let texts: Vec<String> = (0..60).map(|i| format!("review {}", i)).collect();
        let results = scorer(&base).score_batch(&texts, "en").await.unwrap();
        assert_eq!(results.len(), 60);
        assert_eq!(*sizes.lock().unwrap(), vec![25, 25, 10]);
        assert_eq!(results[0].to_score().unwrap(), 5.0);
    }

    #[tokio::test]
    async fn test_status_codes_map_to_error_classes() {
        let router = Router::new().route(
            "/sentiment/batch",
            post(|Json(body): Json<serde_json::Value>| async move {
                let code = match body["texts"][0].as_str().unwrap() {
                    "throttle" => StatusCode::TOO_MANY_REQUESTS,
                    "auth" => StatusCode::UNAUTHORIZED,
                    "bad" => StatusCode::BAD_REQUEST,
                    _ => StatusCode::SERVICE_UNAVAILABLE,
                };
                (code, "nope")
            }),
        );
        let base = spawn_service(router).await;
        let scorer = scorer(&base);

        for (text, class) in [
            ("throttle", "throttled"),
            ("auth", "unauthorized"),
            ("bad", "invalid_input"),
            ("down", "unavailable"),
        ] {
            let err = scorer
                .score_batch(&[text.to_string()], "en")
                .await
                .unwrap_err();
            assert_eq!(err.class(), class, "for {}", text);
        }
    }

    #[tokio::test]
    async fn test_short_result_list_is_malformed() {
        let router = Router::new().route(
            "/sentiment/batch",
            post(|| async { Json(serde_json::json!({ "results": [] })) }),
        );
        let base = spawn_service(router).await;
        let err = scorer(&base)
            .score_batch(&["one".to_string()], "en")
            .await
            .unwrap_err();
        assert_eq!(err.class(), "malformed_response");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        let scorer = HttpSentimentScorer::new(
            "http://127.0.0.1:1",
            None,
            Duration::from_millis(500),
            25,
        )
        .unwrap();
        let err = scorer
            .score_batch(&["x".to_string()], "en")
            .await
            .unwrap_err();
        assert_eq!(err.class(), "unavailable");
    }
}
