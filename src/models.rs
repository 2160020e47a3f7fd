//! Data model shared by the page store, the state machine and the control API.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lowest value on the sentiment scale (all-negative).
pub const SCORE_MIN: f64 = 1.0;
/// Highest value on the sentiment scale (all-positive).
pub const SCORE_MAX: f64 = 5.0;

/// One request to the review source, built once per iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub source_id: String,
    /// 1-based page index.
    pub page_index: u64,
    pub page_size: u32,
}

/// A raw review as fetched from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ReviewRecord {
    /// Text worth sending to the scorer, if any.
    pub fn scorable_text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// One fetched page, written verbatim to the page store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub records: Vec<ReviewRecord>,
    pub has_more: bool,
    #[serde(default)]
    pub total_known: Option<u64>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub sale_price: Option<f64>,
}

/// The parts of a page the state machine keeps after the fetch step.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSummary {
    pub record_count: usize,
    pub has_more: bool,
    pub total_known: Option<u64>,
    pub product_name: Option<String>,
    pub sale_price: Option<f64>,
}

impl From<&PageResult> for PageSummary {
    fn from(page: &PageResult) -> Self {
        Self {
            record_count: page.records.len(),
            has_more: page.has_more,
            total_known: page.total_known,
            product_name: page.product_name.clone(),
            sale_price: page.sale_price,
        }
    }
}

/// Score of one record after chunk merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordScore {
    pub record_id: String,
    /// Sentiment on the 1.0..=5.0 scale.
    pub score: f64,
    /// Probability of the dominant sentiment class.
    pub confidence: f64,
    pub weight: f64,
}

/// All scores produced for one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBatch {
    pub scores: Vec<RecordScore>,
    /// Records on the page that had no text to score.
    pub skipped: u64,
}

impl ScoreBatch {
    pub fn weight(&self) -> f64 {
        self.scores.iter().map(|s| s.weight).sum()
    }

    pub fn weighted_sum(&self) -> f64 {
        self.scores.iter().map(|s| s.score * s.weight).sum()
    }
}

/// How much each record contributes to the running average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightPolicy {
    /// Every record weighs 1.
    #[default]
    Uniform,
    /// A record weighs its text length in UTF-8 bytes.
    ContentLength,
}

impl WeightPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uniform => "uniform",
            Self::ContentLength => "content_length",
        }
    }

    pub fn weight_of(&self, text: &str) -> f64 {
        match self {
            Self::Uniform => 1.0,
            Self::ContentLength => text.len() as f64,
        }
    }
}

impl fmt::Display for WeightPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WeightPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uniform" => Ok(Self::Uniform),
            "content_length" | "length" => Ok(Self::ContentLength),
            _ => Err(format!(
                "Invalid weight policy '{}'. Valid values: uniform, content_length",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Which external step failed a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Fetch,
    Score,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => f.write_str("fetch"),
            Self::Score => f.write_str("score"),
        }
    }
}

/// Diagnostic context for a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub step: StepKind,
    pub page_index: u64,
    pub error_class: String,
    pub message: String,
    pub attempts: u32,
}

/// Product metadata captured from the first fetched page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMeta {
    pub product_name: Option<String>,
    pub sale_price: Option<f64>,
    pub total_known: Option<u64>,
}

/// Parameters fixed when a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    pub source_id: String,
    pub max_records: u64,
    pub page_size: u32,
    #[serde(default)]
    pub weight_policy: WeightPolicy,
    pub language_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_url: Option<String>,
}

/// Read-only snapshot returned by progress queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub run_id: String,
    pub source_id: String,
    pub status: RunStatus,
    pub cursor: u64,
    pub pages_processed: u64,
    pub records_processed: u64,
    pub records_skipped: u64,
    pub total_weight: f64,
    pub average: Option<f64>,
    pub max_records: u64,
    pub total_known: Option<u64>,
    pub product_name: Option<String>,
    pub sale_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_url: Option<String>,
    pub failure: Option<RunFailure>,
}

/// One line of `list` output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub source_id: String,
    pub status: RunStatus,
    pub records_processed: u64,
    pub average: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrips_through_str() {
        for status in [
            RunStatus::Running,
            RunStatus::Paused,
            RunStatus::Cancelled,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_scorable_text_skips_blank() {
        let blank = ReviewRecord {
            id: "a".into(),
            text: Some("   ".into()),
        };
        let none = ReviewRecord {
            id: "b".into(),
            text: None,
        };
        let real = ReviewRecord {
            id: "c".into(),
            text: Some("Great blender".into()),
        };
        assert_eq!(blank.scorable_text(), None);
        assert_eq!(none.scorable_text(), None);
        assert_eq!(real.scorable_text(), Some("Great blender"));
    }

    #[test]
    fn test_weight_policy() {
        assert_eq!(WeightPolicy::Uniform.weight_of("four"), 1.0);
        assert_eq!(WeightPolicy::ContentLength.weight_of("four"), 4.0);
        assert_eq!(
            "length".parse::<WeightPolicy>().unwrap(),
            WeightPolicy::ContentLength
        );
        assert!("heavy".parse::<WeightPolicy>().is_err());
    }

    #[test]
    fn test_score_batch_sums() {
        let batch = ScoreBatch {
            scores: vec![
                RecordScore {
                    record_id: "a".into(),
                    score: 5.0,
                    confidence: 0.9,
                    weight: 2.0,
                },
                RecordScore {
                    record_id: "b".into(),
                    score: 1.0,
                    confidence: 0.8,
                    weight: 1.0,
                },
            ],
            skipped: 0,
        };
        assert_eq!(batch.weight(), 3.0);
        assert_eq!(batch.weighted_sum(), 11.0);
    }

    #[test]
    fn test_page_result_deserializes_without_metadata() {
        let page: PageResult =
            serde_json::from_str(r#"{"records":[{"id":"1","text":"ok"}],"has_more":true}"#)
                .unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(page.has_more);
        assert_eq!(page.total_known, None);
    }
}
