//! Durable run checkpoints.
//!
//! One row per run holds the parameters and the latest committed aggregate.
//! Every completed page also writes a row to `iterations`, keyed by
//! `(run_id, page_index)`, in the same transaction that advances the run. The
//! unique key is what makes a replayed iteration impossible to fold twice.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::aggregate::{AggregateState, FoldDelta};
use crate::errors::CheckpointError;
use crate::models::{
    Progress, RunFailure, RunParams, RunStatus, RunSummary, SourceMeta, WeightPolicy,
};

type Result<T> = std::result::Result<T, CheckpointError>;

/// Async-safe handle to the checkpoint database.
///
/// Runs every access on tokio's blocking pool so SQLite I/O never stalls the
/// async workers driving runs.
#[derive(Clone)]
pub struct CheckpointHandle {
    inner: Arc<std::sync::Mutex<CheckpointDb>>,
}

impl CheckpointHandle {
    pub fn new(db: CheckpointDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CheckpointDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| CheckpointError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| CheckpointError::TaskPanicked(e.to_string()))?
    }
}

/// A run as last committed.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub params: RunParams,
    pub state: AggregateState,
    pub meta: SourceMeta,
    pub failure: Option<RunFailure>,
    pub created_at: String,
    pub updated_at: String,
}

impl RunRecord {
    pub fn progress(&self) -> Progress {
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
}

/// One committed page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationRecord {
    pub page_index: u64,
    pub records: u64,
    pub skipped: u64,
    pub weight: f64,
    pub weighted_sum: f64,
    pub has_more: bool,
    pub committed_at: String,
}

pub struct CheckpointDb {
    conn: Connection,
}

const RUN_COLUMNS: &str = "run_id, source_id, max_records, page_size, weight_policy, \
     language_code, status, cursor, pages_processed, records_processed, records_skipped, \
     total_weight, weighted_sum, product_name, sale_price, total_known, failure, \
     created_at, updated_at, product_url";

fn invalid(msg: impl Into<String>) -> CheckpointError {
    CheckpointError::InvalidRow(msg.into())
}

fn read_run(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        run_id: row.get(0)?,
        source_id: row.get(1)?,
        max_records: row.get(2)?,
        page_size: row.get(3)?,
        weight_policy: row.get(4)?,
        language_code: row.get(5)?,
        status: row.get(6)?,
        cursor: row.get(7)?,
        pages_processed: row.get(8)?,
        records_processed: row.get(9)?,
        records_skipped: row.get(10)?,
        total_weight: row.get(11)?,
        weighted_sum: row.get(12)?,
        product_name: row.get(13)?,
        sale_price: row.get(14)?,
        total_known: row.get(15)?,
        failure: row.get(16)?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
        product_url: row.get(19)?,
    })
}

/// Row exactly as stored; converted to `RunRecord` outside the rusqlite closure
/// so parse failures surface as `InvalidRow`.
struct RawRun {
    run_id: String,
    source_id: String,
    max_records: i64,
    page_size: i64,
    weight_policy: String,
    language_code: String,
    status: String,
    cursor: i64,
    pages_processed: i64,
    records_processed: i64,
    records_skipped: i64,
    total_weight: f64,
    weighted_sum: f64,
    product_name: Option<String>,
    sale_price: Option<f64>,
    total_known: Option<i64>,
    failure: Option<String>,
    created_at: String,
    updated_at: String,
    product_url: Option<String>,
}

impl RawRun {
    fn into_record(self) -> Result<RunRecord> {
        let status: RunStatus = self.status.parse().map_err(invalid)?;
        let weight_policy: WeightPolicy = self.weight_policy.parse().map_err(invalid)?;
        let failure = match self.failure {
            Some(json) => Some(
                serde_json::from_str(&json)
                    .map_err(|e| invalid(format!("failure column: {}", e)))?,
            ),
            None => None,
        };
        Ok(RunRecord {
            params: RunParams {
                source_id: self.source_id,
                max_records: self.max_records as u64,
                page_size: self.page_size as u32,
                weight_policy,
                language_code: self.language_code,
                product_url: self.product_url,
            },
            state: AggregateState {
                pages_processed: self.pages_processed as u64,
                records_processed: self.records_processed as u64,
                records_skipped: self.records_skipped as u64,
                total_weight: self.total_weight,
                weighted_sum: self.weighted_sum,
                max_records: self.max_records as u64,
                cursor: self.cursor as u64,
                status,
            },
            meta: SourceMeta {
                product_name: self.product_name,
                sale_price: self.sale_price,
                total_known: self.total_known.map(|n| n as u64),
            },
            failure,
            run_id: self.run_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl CheckpointDb {
    /// Open (or create) a checkpoint database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory checkpoint database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                max_records INTEGER NOT NULL,
                page_size INTEGER NOT NULL,
                weight_policy TEXT NOT NULL DEFAULT 'uniform',
                language_code TEXT NOT NULL DEFAULT 'en',
                status TEXT NOT NULL DEFAULT 'running',
                cursor INTEGER NOT NULL DEFAULT 1,
                pages_processed INTEGER NOT NULL DEFAULT 0,
                records_processed INTEGER NOT NULL DEFAULT 0,
                records_skipped INTEGER NOT NULL DEFAULT 0,
                total_weight REAL NOT NULL DEFAULT 0,
                weighted_sum REAL NOT NULL DEFAULT 0,
                product_name TEXT,
                sale_price REAL,
                total_known INTEGER,
                failure TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS iterations (
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                page_index INTEGER NOT NULL,
                records INTEGER NOT NULL,
                skipped INTEGER NOT NULL,
                weight REAL NOT NULL,
                weighted_sum REAL NOT NULL,
                has_more INTEGER NOT NULL,
                committed_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (run_id, page_index)
            );

            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            ",
        )?;

        // Additive migrations; the column may already be there.
        match self.conn.execute("ALTER TABLE runs ADD COLUMN product_url TEXT", []) {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub fn create_run(&self, run_id: &str, params: &RunParams) -> Result<RunRecord> {
        self.conn.execute(
            "INSERT INTO runs (run_id, source_id, max_records, page_size, weight_policy,
                               language_code, product_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                params.source_id,
                params.max_records as i64,
                params.page_size as i64,
                params.weight_policy.as_str(),
                params.language_code,
                params.product_url,
            ],
        )?;
        self.load_run(run_id)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id],
                read_run,
            )
            .optional()?;
        raw.map(RawRun::into_record).transpose()
    }

    pub fn load_run(&self, run_id: &str) -> Result<RunRecord> {
        self.get_run(run_id)?
            .ok_or_else(|| CheckpointError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Commit one completed page: the iteration row and the advanced run state
    /// land together or not at all.
    pub fn commit_iteration(
        &self,
        run_id: &str,
        delta: &FoldDelta,
        has_more: bool,
        state: &AggregateState,
        meta: &SourceMeta,
    ) -> Result<()> {
        // DbHandle's Mutex already serialises access to this connection.
        let tx = self.conn.unchecked_transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO iterations
                (run_id, page_index, records, skipped, weight, weighted_sum, has_more)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                delta.page_index as i64,
                delta.records as i64,
                delta.skipped as i64,
                delta.weight,
                delta.weighted_sum,
                has_more,
            ],
        )?;
        if inserted == 0 {
            return Err(CheckpointError::DuplicateIteration {
                run_id: run_id.to_string(),
                page_index: delta.page_index,
            });
        }

        let updated = tx.execute(
            "UPDATE runs SET
                status = ?2, cursor = ?3, pages_processed = ?4, records_processed = ?5,
                records_skipped = ?6, total_weight = ?7, weighted_sum = ?8,
                product_name = ?9, sale_price = ?10, total_known = ?11,
                updated_at = datetime('now')
             WHERE run_id = ?1",
            params![
                run_id,
                state.status.as_str(),
                state.cursor as i64,
                state.pages_processed as i64,
                state.records_processed as i64,
                state.records_skipped as i64,
                state.total_weight,
                state.weighted_sum,
                meta.product_name,
                meta.sale_price,
                meta.total_known.map(|n| n as i64),
            ],
        )?;
        if updated == 0 {
            return Err(CheckpointError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }

        tx.commit()?;
        Ok(())
    }

    /// Record a status change that happens outside an iteration commit
    /// (pause, resume, cancel, failure).
    pub fn save_status(
        &self,
        run_id: &str,
        status: RunStatus,
        failure: Option<&RunFailure>,
    ) -> Result<()> {
        let failure = failure
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| invalid(format!("failure encode: {}", e)))?;
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?2, failure = ?3, updated_at = datetime('now')
             WHERE run_id = ?1",
            params![run_id, status.as_str(), failure],
        )?;
        if updated == 0 {
            return Err(CheckpointError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        Ok(())
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], read_run)?;
        let mut runs = Vec::new();
        for row in rows {
            let record = row?.into_record()?;
            runs.push(RunSummary {
                average: record.state.average(),
                run_id: record.run_id,
                source_id: record.params.source_id,
                status: record.state.status,
                records_processed: record.state.records_processed,
                created_at: record.created_at,
                updated_at: record.updated_at,
            });
        }
        Ok(runs)
    }

    /// Runs a restarted worker must pick back up.
    pub fn list_resumable(&self) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM runs WHERE status IN ('running', 'paused') ORDER BY rowid",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map([], read_run)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_record()?);
        }
        Ok(runs)
    }

    pub fn iterations(&self, run_id: &str) -> Result<Vec<IterationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT page_index, records, skipped, weight, weighted_sum, has_more, committed_at
             FROM iterations WHERE run_id = ?1 ORDER BY page_index",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(IterationRecord {
                page_index: row.get::<_, i64>(0)? as u64,
                records: row.get::<_, i64>(1)? as u64,
                skipped: row.get::<_, i64>(2)? as u64,
                weight: row.get(3)?,
                weighted_sum: row.get(4)?,
                has_more: row.get(5)?,
                committed_at: row.get(6)?,
            })
        })?;
        let mut iterations = Vec::new();
        for row in rows {
            iterations.push(row?);
        }
        Ok(iterations)
    }

    /// Raw SQL for tests that need to break the store on purpose.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        Ok(self.conn.execute_batch(sql)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecordScore, ScoreBatch, StepKind};

    fn params() -> RunParams {
        RunParams {
            source_id: "item-42".into(),
            max_records: 100,
            page_size: 10,
            weight_policy: WeightPolicy::Uniform,
            language_code: "en".into(),
            product_url: None,
        }
    }

    fn batch(n: usize, score: f64) -> ScoreBatch {
        ScoreBatch {
            scores: (0..n)
                .map(|i| RecordScore {
                    record_id: i.to_string(),
                    score,
                    confidence: 1.0,
                    weight: 1.0,
                })
                .collect(),
            skipped: 0,
        }
    }

    #[test]
    fn test_create_and_load_run() -> Result<()> {
        let db = CheckpointDb::new_in_memory()?;
        let created = db.create_run("run-1", &params())?;
        assert_eq!(created.state, AggregateState::new(100));
        assert_eq!(created.params, params());
        assert!(!created.created_at.is_empty());

        let loaded = db.load_run("run-1")?;
        assert_eq!(loaded, created);
        Ok(())
    }

    #[test]
    fn test_load_missing_run() -> Result<()> {
        let db = CheckpointDb::new_in_memory()?;
        assert!(matches!(
            db.load_run("nope"),
            Err(CheckpointError::RunNotFound { .. })
        ));
        assert!(db.get_run("nope")?.is_none());
        Ok(())
    }

    #[test]
    fn test_commit_iteration_advances_state() -> Result<()> {
        let db = CheckpointDb::new_in_memory()?;
        db.create_run("run-1", &params())?;

        let mut state = AggregateState::new(100);
        let delta = state.fold(1, &batch(10, 4.0));
        state.cursor = 2;
        let meta = SourceMeta {
            product_name: Some("Kettle".into()),
            sale_price: Some(25.0),
            total_known: Some(31),
        };
        db.commit_iteration("run-1", &delta, true, &state, &meta)?;

        let loaded = db.load_run("run-1")?;
        assert_eq!(loaded.state, state);
        assert_eq!(loaded.meta, meta);
        assert_eq!(loaded.progress().average, Some(4.0));

        let iterations = db.iterations("run-1")?;
        assert_eq!(iterations.len(), 1);
        assert_eq!(iterations[0].page_index, 1);
        assert_eq!(iterations[0].records, 10);
        assert!(iterations[0].has_more);
        Ok(())
    }

    #[test]
    fn test_duplicate_iteration_is_rejected_atomically() -> Result<()> {
        let db = CheckpointDb::new_in_memory()?;
        db.create_run("run-1", &params())?;

        let mut state = AggregateState::new(100);
        let delta = state.fold(1, &batch(10, 2.0));
        state.cursor = 2;
        db.commit_iteration("run-1", &delta, true, &state, &SourceMeta::default())?;

        // Replaying page 1 must not fold it a second time.
        let mut replay = state.clone();
        let again = replay.fold(1, &batch(10, 2.0));
        replay.cursor = 2;
        let err = db
            .commit_iteration("run-1", &again, true, &replay, &SourceMeta::default())
            .unwrap_err();
        assert!(matches!(err, CheckpointError::DuplicateIteration { page_index: 1, .. }));
        assert_eq!(db.load_run("run-1")?.state.records_processed, 10);
        Ok(())
    }

    #[test]
    fn test_save_status_with_failure() -> Result<()> {
        let db = CheckpointDb::new_in_memory()?;
        db.create_run("run-1", &params())?;
        let failure = RunFailure {
            step: StepKind::Fetch,
            page_index: 2,
            error_class: "not_found".into(),
            message: "gone".into(),
            attempts: 1,
        };
        db.save_status("run-1", RunStatus::Failed, Some(&failure))?;

        let loaded = db.load_run("run-1")?;
        assert_eq!(loaded.state.status, RunStatus::Failed);
        assert_eq!(loaded.failure, Some(failure));
        Ok(())
    }

    #[test]
    fn test_list_resumable_skips_terminal_runs() -> Result<()> {
        let db = CheckpointDb::new_in_memory()?;
        db.create_run("a", &params())?;
        db.create_run("b", &params())?;
        db.create_run("c", &params())?;
        db.save_status("b", RunStatus::Paused, None)?;
        db.save_status("c", RunStatus::Completed, None)?;

        let ids: Vec<_> = db
            .list_resumable()?
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        Ok(())
    }

    #[test]
    fn test_list_runs_newest_first_with_limit() -> Result<()> {
        let db = CheckpointDb::new_in_memory()?;
        for id in ["a", "b", "c"] {
            db.create_run(id, &params())?;
        }
        let runs = db.list_runs(2)?;
        let ids: Vec<_> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(runs[0].average, None);
        Ok(())
    }

    #[test]
    fn test_reopen_file_database_keeps_state() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.db");
        let with_url = RunParams {
            product_url: Some("https://shop.test/ip/item-42".into()),
            ..params()
        };
        {
            let db = CheckpointDb::new(&path)?;
            db.create_run("run-1", &with_url)?;
            db.save_status("run-1", RunStatus::Paused, None)?;
        }
        // Reopening runs the column migration again.
        let db = CheckpointDb::new(&path)?;
        let loaded = db.load_run("run-1")?;
        assert_eq!(loaded.state.status, RunStatus::Paused);
        assert_eq!(loaded.params, with_url);
        assert_eq!(
            loaded.progress().product_url.as_deref(),
            Some("https://shop.test/ip/item-42")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_handle_runs_on_blocking_pool() -> Result<()> {
        let handle = CheckpointHandle::new(CheckpointDb::new_in_memory()?);
        handle.call(|db| db.create_run("run-1", &params())).await?;
        let record = handle.call(|db| db.load_run("run-1")).await?;
        assert_eq!(record.params.source_id, "item-42");
        Ok(())
    }
}
