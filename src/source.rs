//! Review source: fetches one page of reviews for a product.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;

use crate::errors::FetchError;
use crate::models::{PageRequest, PageResult, ReviewRecord};

/// Abstraction over the review API for testability.
/// Real implementation: `HttpReviewSource`.
#[async_trait]
pub trait ReviewSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResult, FetchError>;
}

/// Static consumer credentials sent with every request.
#[derive(Debug, Clone, Default)]
pub struct ConsumerHeaders {
    pub consumer_id: Option<String>,
    pub key_version: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReview {
    #[serde(default)]
    review_id: Option<serde_json::Value>,
    #[serde(default)]
    review_text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatistics {
    #[serde(default)]
    total_review_count: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPage {
    #[serde(default)]
    reviews: Option<Vec<RawReview>>,
    #[serde(default)]
    next_page: Option<String>,
    #[serde(default)]
    review_statistics: Option<RawStatistics>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    sale_price: Option<f64>,
}

/// The API reports counts as either numbers or numeric strings.
fn as_count(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_id(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl RawPage {
    fn into_page(self, page_index: u64) -> PageResult {
        let records = self
            .reviews
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, review)| ReviewRecord {
                id: as_id(review.review_id.as_ref())
                    .unwrap_or_else(|| format!("p{}-{}", page_index, i)),
                text: review.review_text,
            })
            .collect();
        PageResult {
            records,
            has_more: self.next_page.is_some_and(|next| !next.trim().is_empty()),
            total_known: self
                .review_statistics
                .and_then(|s| s.total_review_count)
                .as_ref()
                .and_then(as_count),
            product_name: self.name,
            sale_price: self.sale_price,
        }
    }
}

/// `base` with `segments` appended, each percent-encoded as one path segment.
pub fn segment_url(base: &reqwest::Url, segments: &[&str]) -> reqwest::Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

#[derive(Clone)]
pub struct HttpReviewSource {
    client: reqwest::Client,
    api_base: reqwest::Url,
}

impl HttpReviewSource {
    pub fn new(api_base: &str, headers: &ConsumerHeaders, timeout: Duration) -> anyhow::Result<Self> {
        let mut map = HeaderMap::new();
        for (name, value) in [
            ("wm_consumer.id", headers.consumer_id.as_deref()),
            ("wm_sec.key_version", headers.key_version.as_deref()),
        ] {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                map.insert(
                    HeaderName::from_static(name),
                    HeaderValue::from_str(value)
                        .map_err(|e| anyhow::anyhow!("invalid {} header: {}", name, e))?,
                );
            }
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(map)
            .build()?;
        let api_base = reqwest::Url::parse(api_base)
            .map_err(|e| anyhow::anyhow!("invalid api_base '{}': {}", api_base, e))?;
        if api_base.cannot_be_a_base() {
            anyhow::bail!("api_base '{}' cannot take a path", api_base);
        }
        Ok(Self { client, api_base })
    }
}

fn classify_status(status: StatusCode, detail: String) -> FetchError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::AuthError(detail),
        StatusCode::NOT_FOUND => FetchError::NotFound(detail),
        s if s.is_server_error() => FetchError::Unavailable(detail),
        _ => FetchError::MalformedResponse(detail),
    }
}

#[async_trait]
impl ReviewSource for HttpReviewSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResult, FetchError> {
        let url = segment_url(&self.api_base, &["reviews", request.source_id.as_str()]);
        let resp = self
            .client
            .get(url.clone())
            .query(&[
                ("page", request.page_index.to_string()),
                ("pageSize", request.page_size.to_string()),
            ])
            .send()
            .await
            .map_err(|e| FetchError::Unavailable(format!("{}: {}", url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(status, format!("{} {}: {}", url, status, body)));
        }

        let raw: RawPage = resp
            .json()
            .await
            .map_err(|e| FetchError::MalformedResponse(format!("{}: {}", url, e)))?;
        let page = raw.into_page(request.page_index);
        tracing::debug!(
            source_id = %request.source_id,
            page_index = request.page_index,
            records = page.records.len(),
            has_more = page.has_more,
            "fetched page"
        );
        Ok(page)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Scripted source: serves fixed pages and can fail chosen page indexes.
    pub struct ScriptedSource {
        pages: Vec<PageResult>,
        failures: Mutex<HashMap<u64, Vec<FetchError>>>,
        pub calls: Mutex<Vec<u64>>,
    }

    impl ScriptedSource {
        pub fn new(pages: Vec<PageResult>) -> Self {
            Self {
                pages,
                failures: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// `count` pages of `per_page` records each, with `has_more` on all but the last.
        pub fn uniform(count: usize, per_page: usize) -> Self {
            let pages = (0..count)
                .map(|p| PageResult {
                    records: (0..per_page)
                        .map(|r| ReviewRecord {
                            id: format!("{}-{}", p + 1, r),
                            text: Some(format!("review {} on page {}", r, p + 1)),
                        })
                        .collect(),
                    has_more: p + 1 < count,
                    total_known: Some((count * per_page) as u64),
                    product_name: Some("Test Blender".into()),
                    sale_price: Some(49.5),
                })
                .collect();
            Self::new(pages)
        }

        /// Fail `page_index` with the given errors in order before serving it.
        pub fn fail_page(self, page_index: u64, errors: Vec<FetchError>) -> Self {
            self.failures.lock().unwrap().insert(page_index, errors);
            self
        }

        pub fn calls(&self) -> Vec<u64> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReviewSource for ScriptedSource {
        async fn fetch_page(&self, request: &PageRequest) -> Result<PageResult, FetchError> {
            self.calls.lock().unwrap().push(request.page_index);
            if let Some(queue) = self.failures.lock().unwrap().get_mut(&request.page_index)
                && !queue.is_empty()
            {
                return Err(queue.remove(0));
            }
            let idx = (request.page_index - 1) as usize;
            Ok(self.pages.get(idx).cloned().unwrap_or(PageResult {
                records: Vec::new(),
                has_more: false,
                total_known: None,
                product_name: None,
                sale_price: None,
            }))
        }
    }
}
