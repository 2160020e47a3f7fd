//! Sentiment scoring.
//!
//! Converts class probabilities from the sentiment service into a 1.0..=5.0
//! score, splits texts the service would reject for size, and merges chunk
//! scores back into one score per record.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ScoreError;
use crate::models::{RecordScore, ReviewRecord, SCORE_MAX, SCORE_MIN, ScoreBatch, WeightPolicy};

pub use http::HttpSentimentScorer;

/// Largest text the sentiment service accepts, in UTF-8 bytes.
pub const DEFAULT_MAX_TEXT_BYTES: usize = 5000;

/// Class probabilities for one text.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SentimentScores {
    pub positive: f64,
    pub negative: f64,
    #[serde(default)]
    pub neutral: f64,
    #[serde(default)]
    pub mixed: f64,
}

impl SentimentScores {
    fn total(&self) -> f64 {
        self.positive + self.negative + self.neutral + self.mixed
    }

    fn validate(&self) -> Result<(), ScoreError> {
        let parts = [self.positive, self.negative, self.neutral, self.mixed];
        if parts.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(ScoreError::MalformedResponse(format!(
                "class probabilities out of range: {:?}",
                self
            )));
        }
        if self.total() <= 0.0 {
            return Err(ScoreError::MalformedResponse(
                "class probabilities sum to zero".into(),
            ));
        }
        Ok(())
    }

    /// Positive counts 5, negative 1, neutral and mixed 3, normalised by the
    /// probability mass so the result stays on the scale.
    pub fn to_score(&self) -> Result<f64, ScoreError> {
        self.validate()?;
        let raw = SCORE_MAX * self.positive
            + SCORE_MIN * self.negative
            + 3.0 * self.neutral
            + 3.0 * self.mixed;
        Ok((raw / self.total()).clamp(SCORE_MIN, SCORE_MAX))
    }

    /// Share of the dominant class.
    pub fn confidence(&self) -> Result<f64, ScoreError> {
        self.validate()?;
        let top = self
            .positive
            .max(self.negative)
            .max(self.neutral)
            .max(self.mixed);
        Ok((top / self.total()).clamp(0.0, 1.0))
    }
}

/// Abstraction over the sentiment service for testability.
/// Real implementation: `HttpSentimentScorer`.
#[async_trait]
pub trait SentimentScorer: Send + Sync {
    /// Score every text, returning results in input order.
    async fn score_batch(
        &self,
        texts: &[String],
        language_code: &str,
    ) -> Result<Vec<SentimentScores>, ScoreError>;
}

/// Split `text` into pieces of at most `max_bytes`, cutting on character
/// boundaries and preferring the last whitespace inside the window.
pub fn split_text(text: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.len() > max_bytes {
        let mut end = max_bytes;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            // A single character wider than the window still has to go somewhere.
            end = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        } else if let Some((pos, ws)) = rest[..end]
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
            && pos > 0
        {
            end = pos + ws.len_utf8();
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}

struct PlannedRecord<'a> {
    id: &'a str,
    weight: f64,
    chunks: Vec<&'a str>,
}

/// Score one page's records.
///
/// At most `limit` scorable records are scored; blank records before the cut
/// are counted as skipped, records after it are ignored. All chunks go to the
/// scorer in one call, and nothing is called when there is nothing to score.
pub async fn score_page(
    scorer: &dyn SentimentScorer,
    records: &[ReviewRecord],
    limit: u64,
    policy: WeightPolicy,
    max_text_bytes: usize,
    language_code: &str,
) -> Result<ScoreBatch, ScoreError> {
    let mut planned: Vec<PlannedRecord<'_>> = Vec::new();
    let mut skipped = 0u64;

    for record in records {
        if planned.len() as u64 >= limit {
            break;
        }
        match record.scorable_text() {
            Some(text) => planned.push(PlannedRecord {
                id: &record.id,
                weight: policy.weight_of(text),
                chunks: split_text(text, max_text_bytes)
                    .into_iter()
                    .filter(|c| !c.trim().is_empty())
                    .collect(),
            }),
            None => skipped += 1,
        }
    }

    let texts: Vec<String> = planned
        .iter()
        .flat_map(|p| p.chunks.iter().map(|c| c.to_string()))
        .collect();
    if texts.is_empty() {
        return Ok(ScoreBatch {
            scores: Vec::new(),
            skipped,
        });
    }

    let results = scorer.score_batch(&texts, language_code).await?;
    if results.len() != texts.len() {
        return Err(ScoreError::MalformedResponse(format!(
            "expected {} results, got {}",
            texts.len(),
            results.len()
        )));
    }

    let mut results = results.into_iter();
    let mut scores = Vec::with_capacity(planned.len());
    for record in planned {
        let mut weighted_score = 0.0;
        let mut weighted_confidence = 0.0;
        let mut total_len = 0.0;
        for chunk in &record.chunks {
            let Some(result) = results.next() else {
                return Err(ScoreError::MalformedResponse("result list ended early".into()));
            };
            let len = chunk.len() as f64;
            weighted_score += result.to_score()? * len;
            weighted_confidence += result.confidence()? * len;
            total_len += len;
        }
        scores.push(RecordScore {
            record_id: record.id.to_string(),
            score: (weighted_score / total_len).clamp(SCORE_MIN, SCORE_MAX),
            confidence: weighted_confidence / total_len,
            weight: record.weight,
        });
    }

    Ok(ScoreBatch { scores, skipped })
}
