//! Fold-only running statistic for a run.
//!
//! Individual scores are never retained: each completed page contributes its
//! record count, total weight and weighted score sum, and nothing else.

use serde::{Deserialize, Serialize};

use crate::models::{RunStatus, ScoreBatch};

/// The only state carried across a whole run besides run parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    pub pages_processed: u64,
    pub records_processed: u64,
    pub records_skipped: u64,
    pub total_weight: f64,
    pub weighted_sum: f64,
    pub max_records: u64,
    /// Page index of the next iteration.
    pub cursor: u64,
    pub status: RunStatus,
}

/// What one page added to the aggregate. Persisted with each committed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldDelta {
    pub page_index: u64,
    pub records: u64,
    pub skipped: u64,
    pub weight: f64,
    pub weighted_sum: f64,
}

impl AggregateState {
    pub fn new(max_records: u64) -> Self {
        Self {
            pages_processed: 0,
            records_processed: 0,
            records_skipped: 0,
            total_weight: 0.0,
            weighted_sum: 0.0,
            max_records,
            cursor: 1,
            status: RunStatus::Running,
        }
    }

    /// Running weighted average, absent until a record has been folded.
    pub fn average(&self) -> Option<f64> {
        if self.records_processed == 0 || self.total_weight <= 0.0 {
            return None;
        }
        Some(self.weighted_sum / self.total_weight)
    }

    pub fn limit_reached(&self) -> bool {
        self.records_processed >= self.max_records
    }

    /// How many more records this run may fold.
    pub fn remaining(&self) -> u64 {
        self.max_records.saturating_sub(self.records_processed)
    }

    /// Apply one page's scores. The caller has already truncated the batch to
    /// `remaining()`; a larger batch is a caller bug, not a data condition.
    pub fn fold(&mut self, page_index: u64, batch: &ScoreBatch) -> FoldDelta {
        let records = batch.scores.len() as u64;
        debug_assert!(records <= self.remaining());

        let delta = FoldDelta {
            page_index,
            records,
            skipped: batch.skipped,
            weight: batch.weight(),
            weighted_sum: batch.weighted_sum(),
        };
        self.weighted_sum += delta.weighted_sum;
        self.total_weight += delta.weight;
        self.records_processed += delta.records;
        self.records_skipped += delta.skipped;
        self.pages_processed += 1;
        delta
    }
}
