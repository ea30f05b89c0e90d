//! SQLite-backed run history.
//!
//! Searches, candidate runs and skipped cluster counts live in three
//! append-only tables. Timestamps are stored as microseconds since the epoch
//! so ordering in SQL matches ordering in Rust.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::common::error::{PersonaError, Result};
use crate::common::ids::RunId;

use super::domain::{Candidate, RunHistory, RunRecord, SearchRun, SkippedCandidate};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS search_runs (
    run_id      TEXT PRIMARY KEY,
    experiment  TEXT NOT NULL,
    rows        INTEGER NOT NULL,
    cols        INTEGER NOT NULL,
    columns     TEXT NOT NULL,
    seed        INTEGER,
    k_min       INTEGER NOT NULL,
    k_max       INTEGER NOT NULL,
    started_at  INTEGER NOT NULL,
    tags        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS candidate_runs (
    run_id         TEXT PRIMARY KEY,
    parent_run_id  TEXT,
    experiment     TEXT NOT NULL,
    k              INTEGER NOT NULL,
    inertia        REAL NOT NULL,
    silhouette     REAL NOT NULL,
    score          REAL NOT NULL,
    model          TEXT NOT NULL,
    rows           INTEGER NOT NULL,
    cols           INTEGER NOT NULL,
    created_at     INTEGER NOT NULL,
    tags           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_candidate_runs_rank
    ON candidate_runs(experiment, score DESC, created_at, run_id);
CREATE TABLE IF NOT EXISTS skipped_candidates (
    parent_run_id  TEXT NOT NULL,
    k              INTEGER NOT NULL,
    reason         TEXT NOT NULL
);
";

pub struct SqliteRunHistory {
    conn: Mutex<Connection>,
}

fn micros(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| PersonaError::invalid(format!("stored timestamp {value} out of range")))
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

struct RawRecord {
    run_id: String,
    parent_run_id: Option<String>,
    experiment: String,
    k: i64,
    inertia: f64,
    silhouette: f64,
    model: String,
    rows: i64,
    cols: i64,
    created_at: i64,
    tags: String,
}

impl RawRecord {
    const COLUMNS: &'static str = "run_id, parent_run_id, experiment, k, inertia, silhouette, \
                                   model, rows, cols, created_at, tags";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            parent_run_id: row.get(1)?,
            experiment: row.get(2)?,
            k: row.get(3)?,
            inertia: row.get(4)?,
            silhouette: row.get(5)?,
            model: row.get(6)?,
            rows: row.get(7)?,
            cols: row.get(8)?,
            created_at: row.get(9)?,
            tags: row.get(10)?,
        })
    }

    /// Rebuild the record; the score is recomputed, never read back.
    fn into_record(self) -> Result<RunRecord> {
        let k = usize::try_from(self.k)
            .map_err(|_| PersonaError::invalid(format!("stored k {} is negative", self.k)))?;
        let candidate = Candidate::new(k, serde_json::from_str(&self.model)?, self.inertia, self.silhouette)?;
        Ok(RunRecord {
            run_id: RunId::new(self.run_id),
            parent_run_id: self.parent_run_id.map(RunId::new),
            experiment: self.experiment,
            candidate,
            input_shape: (self.rows.max(0) as usize, self.cols.max(0) as usize),
            timestamp: from_micros(self.created_at)?,
            tags: serde_json::from_str(&self.tags)?,
        })
    }
}

impl SqliteRunHistory {
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA busy_timeout=5000; PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Skips recorded under one search, in insertion order.
    pub fn skipped(&self, parent: &RunId) -> Result<Vec<SkippedCandidate>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT k, reason FROM skipped_candidates WHERE parent_run_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![parent.as_str()], |row| {
                Ok(SkippedCandidate {
                    k: row.get::<_, i64>(0)?.max(0) as usize,
                    reason: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl RunHistory for SqliteRunHistory {
    fn open_search(&self, run: &SearchRun) -> Result<()> {
        let columns = serde_json::to_string(&run.columns)?;
        let tags = serde_json::to_string(&run.tags)?;
        self.conn.lock().execute(
            "INSERT INTO search_runs
                 (run_id, experiment, rows, cols, columns, seed, k_min, k_max, started_at, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.run_id.as_str(),
                run.experiment,
                to_i64(run.input_shape.0),
                to_i64(run.input_shape.1),
                columns,
                // Seeds keep their bit pattern; SQLite has no unsigned integers.
                run.seed.map(|s| s as i64),
                to_i64(run.k_min),
                to_i64(run.k_max),
                micros(&run.started_at),
                tags,
            ],
        )?;
        Ok(())
    }

    fn append(&self, record: &RunRecord) -> Result<()> {
        let c = &record.candidate;
        let model = serde_json::to_string(c.model())?;
        let tags = serde_json::to_string(&record.tags)?;
        self.conn.lock().execute(
            "INSERT INTO candidate_runs
                 (run_id, parent_run_id, experiment, k, inertia, silhouette, score, model,
                  rows, cols, created_at, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.run_id.as_str(),
                record.parent_run_id.as_ref().map(|p| p.as_str()),
                record.experiment,
                to_i64(c.cluster_count()),
                c.inertia(),
                c.silhouette(),
                c.score(),
                model,
                to_i64(record.input_shape.0),
                to_i64(record.input_shape.1),
                micros(&record.timestamp),
                tags,
            ],
        )?;
        Ok(())
    }

    fn record_skip(&self, parent: &RunId, skipped: &SkippedCandidate) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO skipped_candidates (parent_run_id, k, reason) VALUES (?1, ?2, ?3)",
            params![parent.as_str(), to_i64(skipped.k), skipped.reason],
        )?;
        Ok(())
    }

    fn top_by_score(&self, experiment: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM candidate_runs WHERE experiment = ?1
             ORDER BY score DESC, created_at ASC, run_id ASC LIMIT ?2",
            RawRecord::COLUMNS
        ))?;
        let raw = stmt
            .query_map(params![experiment, to_i64(limit)], RawRecord::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRecord::into_record).collect()
    }

    fn get(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        let raw = self
            .conn
            .lock()
            .query_row(
                &format!("SELECT {} FROM candidate_runs WHERE run_id = ?1", RawRecord::COLUMNS),
                params![run_id.as_str()],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }
}
