//! SQLite-backed registry.
//!
//! Promotions run inside `BEGIN IMMEDIATE`, which takes the database write
//! lock up front, so concurrent promoters in other processes are sequenced by
//! SQLite's busy handler. A partial unique index rejects a second Production
//! row outright should anything bypass that.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode as SqliteCode, Row, Transaction, TransactionBehavior};
use tracing::warn;

use crate::common::error::{PersonaError, Result};
use crate::common::ids::RunId;
use crate::common::time::now_utc;

use super::domain::{apply_promotion, ModelRegistry, PromotionResult, RegistryEntry, Stage};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS registry_versions (
    model_name     TEXT NOT NULL,
    version        INTEGER NOT NULL,
    stage          TEXT NOT NULL,
    source_run_id  TEXT NOT NULL,
    created_at     INTEGER NOT NULL,
    PRIMARY KEY (model_name, version)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_registry_one_production
    ON registry_versions(model_name) WHERE stage = 'Production';
";

pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(String, i64, String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode(raw: (String, i64, String, String, i64)) -> Result<RegistryEntry> {
    let (model_name, version, stage, source_run_id, created_at) = raw;
    Ok(RegistryEntry {
        version: u32::try_from(version)
            .map_err(|_| PersonaError::invalid(format!("stored version {version} out of range")))?,
        stage: Stage::parse(&stage)?,
        source_run_id: RunId::new(source_run_id),
        created_at: chrono::DateTime::from_timestamp_micros(created_at).ok_or_else(|| {
            PersonaError::invalid(format!("stored timestamp {created_at} out of range"))
        })?,
        model_name,
    })
}

fn load_versions(conn: &Connection, model_name: &str) -> Result<Vec<RegistryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT model_name, version, stage, source_run_id, created_at
         FROM registry_versions WHERE model_name = ?1 ORDER BY version",
    )?;
    let raw = stmt
        .query_map(params![model_name], entry_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raw.into_iter().map(decode).collect()
}

/// Busy, locked and uniqueness failures mean another writer got there first.
fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(SqliteCode::DatabaseBusy | SqliteCode::DatabaseLocked | SqliteCode::ConstraintViolation)
    )
}

impl SqliteRegistry {
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

    fn insert_version(tx: &Transaction<'_>, model_name: &str, source_run_id: &RunId) -> Result<RegistryEntry> {
        let current: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM registry_versions WHERE model_name = ?1",
            params![model_name],
            |row| row.get(0),
        )?;
        let version = u32::try_from(current + 1)
            .map_err(|_| PersonaError::invalid(format!("{model_name} ran out of versions")))?;
        let created_at = now_utc();
        tx.execute(
            "INSERT INTO registry_versions (model_name, version, stage, source_run_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                model_name,
                i64::from(version),
                Stage::None.as_str(),
                source_run_id.as_str(),
                created_at.timestamp_micros(),
            ],
        )?;
        Ok(RegistryEntry {
            model_name: model_name.to_string(),
            version,
            stage: Stage::None,
            source_run_id: source_run_id.clone(),
            created_at,
        })
    }

    /// Run `step` in one `BEGIN IMMEDIATE` transaction, mapping lock and
    /// uniqueness failures to `ConcurrentPromotion`.
    fn write_exclusive<F>(&self, model_name: &str, version: u32, step: F) -> Result<PromotionResult>
    where
        F: FnOnce(&Transaction<'_>) -> Result<PromotionResult>,
    {
        let contended = |err: rusqlite::Error| {
            if is_contention(&err) {
                warn!(model_name, version, error = %err, "promotion lost a race");
                PersonaError::ConcurrentPromotion {
                    model_name: model_name.to_string(),
                    version,
                }
            } else {
                PersonaError::Storage(err)
            }
        };

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(contended)?;
        let result = match step(&tx) {
            Ok(result) => result,
            Err(PersonaError::Storage(err)) => return Err(contended(err)),
            Err(other) => return Err(other),
        };
        tx.commit().map_err(contended)?;
        Ok(result)
    }

    fn promote_in(tx: &Transaction<'_>, model_name: &str, version: u32) -> Result<PromotionResult> {
        let mut versions = load_versions(tx, model_name)?;
        let result = apply_promotion(model_name, &mut versions, version)?;
        if let PromotionResult::Promoted { archived, .. } = &result {
            // Archive first so the partial index never sees two Production rows.
            if let Some(old) = archived {
                tx.execute(
                    "UPDATE registry_versions SET stage = 'Archived'
                     WHERE model_name = ?1 AND version = ?2",
                    params![model_name, i64::from(*old)],
                )?;
            }
            tx.execute(
                "UPDATE registry_versions SET stage = 'Production'
                 WHERE model_name = ?1 AND version = ?2",
                params![model_name, i64::from(version)],
            )?;
        }
        Ok(result)
    }
}

impl ModelRegistry for SqliteRegistry {
    fn register(&self, model_name: &str, source_run_id: &RunId) -> Result<RegistryEntry> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entry = Self::insert_version(&tx, model_name, source_run_id)?;
        tx.commit()?;
        Ok(entry)
    }

    fn promote(&self, model_name: &str, version: u32) -> Result<PromotionResult> {
        self.write_exclusive(model_name, version, |tx| {
            Self::promote_in(tx, model_name, version)
        })
    }

    fn publish(&self, model_name: &str, source_run_id: &RunId) -> Result<PromotionResult> {
        // Version is unknown until the insert; 0 only labels a lost race.
        self.write_exclusive(model_name, 0, |tx| {
            let active = load_versions(tx, model_name)?
                .into_iter()
                .find(|e| e.stage == Stage::Production && &e.source_run_id == source_run_id);
            if let Some(entry) = active {
                return Ok(PromotionResult::AlreadyActive { entry });
            }
            let entry = Self::insert_version(tx, model_name, source_run_id)?;
            Self::promote_in(tx, model_name, entry.version)
        })
    }

    fn get_active(&self, model_name: &str) -> Result<Option<RegistryEntry>> {
        let conn = self.conn.lock();
        Ok(load_versions(&conn, model_name)?
            .into_iter()
            .find(|e| e.stage == Stage::Production))
    }

    fn list_versions(&self, model_name: &str) -> Result<Vec<RegistryEntry>> {
        let conn = self.conn.lock();
        load_versions(&conn, model_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn versions_increase_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        {
            let registry = SqliteRegistry::open(&path).unwrap();
            assert_eq!(registry.register("m", &RunId::new("a")).unwrap().version, 1);
            assert_eq!(registry.register("m", &RunId::new("b")).unwrap().version, 2);
        }
        let registry = SqliteRegistry::open(&path).unwrap();
        let v3 = registry.register("m", &RunId::new("c")).unwrap();
        assert_eq!(v3.version, 3);
        assert_eq!(v3.stage, Stage::None);
        assert_eq!(registry.list_versions("m").unwrap().len(), 3);
    }

    #[test]
    fn promotion_archives_previous_version() {
        let registry = SqliteRegistry::in_memory().unwrap();
        registry.register("m", &RunId::new("a")).unwrap();
        registry.register("m", &RunId::new("b")).unwrap();
        registry.promote("m", 1).unwrap();
        let result = registry.promote("m", 2).unwrap();
        assert!(matches!(result, PromotionResult::Promoted { archived: Some(1), .. }));

        let active = registry.get_active("m").unwrap().unwrap();
        assert_eq!(active.version, 2);
        let v1 = &registry.list_versions("m").unwrap()[0];
        assert_eq!(v1.stage, Stage::Archived);
    }

    #[test]
    fn unknown_and_archived_versions_are_rejected() {
        let registry = SqliteRegistry::in_memory().unwrap();
        registry.register("m", &RunId::new("a")).unwrap();
        registry.register("m", &RunId::new("b")).unwrap();
        assert!(matches!(
            registry.promote("m", 9).unwrap_err(),
            PersonaError::NotFound { .. }
        ));
        registry.promote("m", 1).unwrap();
        registry.promote("m", 2).unwrap();
        assert!(matches!(
            registry.promote("m", 1).unwrap_err(),
            PersonaError::InvalidTransition { .. }
        ));
        assert_eq!(registry.get_active("m").unwrap().unwrap().version, 2);
    }

    #[test]
    fn index_refuses_a_second_production_row() {
        let registry = SqliteRegistry::in_memory().unwrap();
        registry.register("m", &RunId::new("a")).unwrap();
        registry.register("m", &RunId::new("b")).unwrap();
        registry.promote("m", 1).unwrap();
        let conn = registry.conn.lock();
        let err = conn
            .execute(
                "UPDATE registry_versions SET stage = 'Production' WHERE version = 2",
                [],
            )
            .unwrap_err();
        assert!(is_contention(&err));
    }

    #[test]
    fn publishers_of_one_run_across_connections_add_one_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("registry.db"));
        SqliteRegistry::open(&path).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = Arc::clone(&path);
                thread::spawn(move || {
                    let registry = SqliteRegistry::open(&path)?;
                    registry.publish("m", &RunId::new("winner"))
                })
            })
            .collect();
        for handle in handles {
            match handle.join().unwrap() {
                Ok(_) | Err(PersonaError::ConcurrentPromotion { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        let versions = SqliteRegistry::open(&path).unwrap().list_versions("m").unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].stage, Stage::Production);
    }

    #[test]
    fn publish_is_a_no_op_for_the_active_run() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let first = registry.publish("m", &RunId::new("a")).unwrap();
        assert!(matches!(first, PromotionResult::Promoted { archived: None, .. }));
        let again = registry.publish("m", &RunId::new("a")).unwrap();
        assert!(matches!(again, PromotionResult::AlreadyActive { .. }));
        let next = registry.publish("m", &RunId::new("b")).unwrap();
        assert!(matches!(next, PromotionResult::Promoted { archived: Some(1), .. }));
        assert_eq!(registry.list_versions("m").unwrap().len(), 2);
    }

    #[test]
    fn promoters_across_connections_leave_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let setup = SqliteRegistry::open(&path).unwrap();
        for i in 0..6 {
            setup.register("m", &RunId::new(format!("r{i}"))).unwrap();
        }
        let path = Arc::new(path);
        let handles: Vec<_> = (1..=6u32)
            .map(|v| {
                let path = Arc::clone(&path);
                thread::spawn(move || {
                    let registry = SqliteRegistry::open(&path)?;
                    registry.promote("m", v)
                })
            })
            .collect();
        for handle in handles {
            match handle.join().unwrap() {
                Ok(_) => {}
                Err(PersonaError::ConcurrentPromotion { .. } | PersonaError::InvalidTransition { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        let live = setup
            .list_versions("m")
            .unwrap()
            .into_iter()
            .filter(|e| e.stage == Stage::Production)
            .count();
        assert_eq!(live, 1);
    }
}
