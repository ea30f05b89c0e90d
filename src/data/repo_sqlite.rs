//! SQLite-backed feature tables.
//!
//! Tables created here carry a surrogate `customer_id INTEGER PRIMARY KEY`
//! so every row is uniquely addressable for the label write-back. Tables
//! created elsewhere without that column are still readable; batch scoring
//! then falls back to matching on the feature tuple.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::common::error::{PersonaError, Result};

use super::domain::{
    FeatureVector, Record, RowKey, ScoringRow, ScoringTable, TimeWindow, FEATURE_COLUMNS,
    N_FEATURES,
};
use super::service::parse_date;

/// A named feature table inside a SQLite database.
pub struct SqliteFeatureTable {
    conn: Connection,
    name: String,
    identity: bool,
}

fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_head && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(PersonaError::invalid(format!("invalid table name '{name}'")))
    }
}

fn feature_list() -> String {
    FEATURE_COLUMNS.join(", ")
}

fn columns_of(conn: &Connection, name: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({name})"))?;
    let cols = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(cols)
}

impl SqliteFeatureTable {
    /// Open (creating if needed) a table with a surrogate identity key.
    pub fn create(conn: Connection, name: &str) -> Result<Self> {
        validate_table_name(name)?;
        let features = FEATURE_COLUMNS
            .iter()
            .map(|c| format!("{c} REAL NOT NULL"))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {name} (
                customer_id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                {features},
                persona INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_{name}_date ON {name}(date);"
        ))?;
        Self::open(conn, name)
    }

    /// Open an existing table, detecting whether it has an identity column.
    pub fn open(conn: Connection, name: &str) -> Result<Self> {
        validate_table_name(name)?;
        let cols = columns_of(&conn, name)?;
        if cols.is_empty() {
            return Err(PersonaError::not_found("table", name));
        }
        for required in std::iter::once("date").chain(FEATURE_COLUMNS) {
            if !cols.iter().any(|c| c == required) {
                return Err(PersonaError::invalid(format!(
                    "table {name} lacks column '{required}'"
                )));
            }
        }
        if !cols.iter().any(|c| c == "persona") {
            conn.execute_batch(&format!("ALTER TABLE {name} ADD COLUMN persona INTEGER"))?;
        }
        let identity = cols.iter().any(|c| c == "customer_id");
        Ok(Self {
            conn,
            name: name.to_string(),
            identity,
        })
    }

    pub fn open_path(path: &Path, name: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA busy_timeout=5000; PRAGMA journal_mode=WAL;")?;
        Self::open(conn, name)
    }

    pub fn create_path(path: &Path, name: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA busy_timeout=5000; PRAGMA journal_mode=WAL;")?;
        Self::create(conn, name)
    }

    /// Append records in one transaction, returning the inserted count.
    pub fn insert(&self, records: &[Record]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let placeholders = (3..3 + N_FEATURES)
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = if self.identity {
                format!(
                    "INSERT INTO {} (customer_id, date, {}) VALUES (?1, ?2, {placeholders})",
                    self.name,
                    feature_list()
                )
            } else {
                format!(
                    "INSERT INTO {} (date, {}) VALUES (?2, {placeholders})",
                    self.name,
                    feature_list()
                )
            };
            let mut stmt = tx.prepare(&sql)?;
            for record in records {
                let date = record.date.to_string();
                // Identity is assigned by the table; file-provided ids are dropped.
                let id: Option<i64> = None;
                let f = &record.features;
                stmt.execute(params![
                    id, date, f[0], f[1], f[2], f[3], f[4], f[5], f[6], f[7], f[8], f[9]
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Current label of one row, if it exists.
    pub fn persona_of(&self, customer_id: i64) -> Result<Option<i64>> {
        if !self.identity {
            return Err(PersonaError::invalid(format!(
                "table {} has no customer_id column",
                self.name
            )));
        }
        let persona = self
            .conn
            .query_row(
                &format!("SELECT persona FROM {} WHERE customer_id = ?1", self.name),
                params![customer_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?;
        Ok(persona.flatten())
    }

    fn feature_predicate() -> String {
        FEATURE_COLUMNS
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c} = ?{}", i + 2))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

impl ScoringTable for SqliteFeatureTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_identity(&self) -> Result<bool> {
        Ok(self.identity)
    }

    fn read_window(&self, window: &TimeWindow) -> Result<Vec<ScoringRow>> {
        let id_col = if self.identity { "customer_id" } else { "NULL" };
        let order = if self.identity { "customer_id" } else { "rowid" };
        let sql = format!(
            "SELECT {id_col}, date, {}, persona FROM {} \
             WHERE date >= ?1 AND date < ?2 ORDER BY {order}",
            feature_list(),
            self.name
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt
            .query_map(
                params![window.start.to_string(), window.end.to_string()],
                |row| {
                    let mut features: FeatureVector = [0.0; N_FEATURES];
                    for (i, value) in features.iter_mut().enumerate() {
                        *value = row.get(2 + i)?;
                    }
                    Ok((
                        row.get::<_, Option<i64>>(0)?,
                        row.get::<_, String>(1)?,
                        features,
                        row.get::<_, Option<i64>>(2 + N_FEATURES)?,
                    ))
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(customer_id, stored_date, features, persona)| {
                Ok(ScoringRow {
                    record: Record::new(customer_id, parse_date(&stored_date)?, features),
                    stored_date,
                    persona,
                })
            })
            .collect()
    }

    fn update_persona(&self, key: &RowKey, persona: i64) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let matched = match key {
            RowKey::CustomerId(id) => tx.execute(
                &format!("UPDATE {} SET persona = ?1 WHERE customer_id = ?2", self.name),
                params![persona, id],
            )?,
            RowKey::Features { features, date } => {
                let f = features;
                tx.execute(
                    &format!(
                        "UPDATE {} SET persona = ?1 WHERE {} AND date = ?12",
                        self.name,
                        Self::feature_predicate()
                    ),
                    params![
                        persona,
                        f[0],
                        f[1],
                        f[2],
                        f[3],
                        f[4],
                        f[5],
                        f[6],
                        f[7],
                        f[8],
                        f[9],
                        date
                    ],
                )?
            }
        };
        if matched == 1 {
            tx.commit()?;
        }
        // Dropping the transaction rolls back ambiguous or empty matches.
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::domain::KeyStrategy;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn row(v: f64, d: NaiveDate) -> Record {
        Record::new(None, d, [v; N_FEATURES])
    }

    #[test]
    fn identity_round_trip() {
        let table = SqliteFeatureTable::create(Connection::open_in_memory().unwrap(), "t").unwrap();
        assert!(table.has_identity().unwrap());
        table
            .insert(&[row(1.0, date(2025, 4, 1)), row(2.0, date(2025, 4, 2))])
            .unwrap();

        let rows = table.read_window(&TimeWindow::month(2025, 4).unwrap()).unwrap();
        assert_eq!(rows.len(), 2);
        let id = rows[1].record.customer_id.unwrap();
        assert_eq!(table.update_persona(&RowKey::CustomerId(id), 3).unwrap(), 1);
        assert_eq!(table.persona_of(id).unwrap(), Some(3));
        assert_eq!(table.persona_of(rows[0].record.customer_id.unwrap()).unwrap(), None);
    }

    #[test]
    fn window_excludes_other_months() {
        let table = SqliteFeatureTable::create(Connection::open_in_memory().unwrap(), "t").unwrap();
        table
            .insert(&[
                row(1.0, date(2025, 3, 31)),
                row(2.0, date(2025, 4, 15)),
                row(3.0, date(2025, 5, 1)),
            ])
            .unwrap();
        let rows = table.read_window(&TimeWindow::month(2025, 4).unwrap()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.features[0], 2.0);
    }

    #[test]
    fn legacy_table_without_identity_gets_persona_column() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE legacy (date TEXT, x1 REAL, x2 REAL, x3 REAL, x4 REAL, x5 REAL,
                                  x6 REAL, x7 REAL, x8 REAL, x9 REAL, x10 REAL);",
        )
        .unwrap();
        let table = SqliteFeatureTable::open(conn, "legacy").unwrap();
        assert!(!table.has_identity().unwrap());
        table.insert(&[row(1.0, date(2025, 4, 1))]).unwrap();

        let key = RowKey::Features {
            features: [1.0; N_FEATURES],
            date: "2025-04-01".into(),
        };
        assert_eq!(table.update_persona(&key, 2).unwrap(), 1);
        let rows = table.read_window(&TimeWindow::month(2025, 4).unwrap()).unwrap();
        assert_eq!(rows[0].persona, Some(2));
        assert_eq!(rows[0].record.customer_id, None);
    }

    #[test]
    fn ambiguous_feature_update_is_rolled_back() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE legacy (date TEXT, x1 REAL, x2 REAL, x3 REAL, x4 REAL, x5 REAL,
                                  x6 REAL, x7 REAL, x8 REAL, x9 REAL, x10 REAL, persona INTEGER);",
        )
        .unwrap();
        let table = SqliteFeatureTable::open(conn, "legacy").unwrap();
        table
            .insert(&[row(1.0, date(2025, 4, 1)), row(1.0, date(2025, 4, 1))])
            .unwrap();
        let key = RowKey::Features {
            features: [1.0; N_FEATURES],
            date: "2025-04-01".into(),
        };
        assert_eq!(table.update_persona(&key, 5).unwrap(), 2);
        let rows = table.read_window(&TimeWindow::month(2025, 4).unwrap()).unwrap();
        assert!(rows.iter().all(|r| r.persona.is_none()));
    }

    #[test]
    fn timestamp_dated_rows_match_on_stored_text() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE legacy (date TEXT, x1 REAL, x2 REAL, x3 REAL, x4 REAL, x5 REAL,
                                  x6 REAL, x7 REAL, x8 REAL, x9 REAL, x10 REAL);
             INSERT INTO legacy VALUES ('2025-04-01 00:00:00+00:00', 1, 1, 1, 1, 1, 1, 1, 1, 1, 1);",
        )
        .unwrap();
        let table = SqliteFeatureTable::open(conn, "legacy").unwrap();
        let rows = table.read_window(&TimeWindow::month(2025, 4).unwrap()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.date, date(2025, 4, 1));
        assert_eq!(rows[0].stored_date, "2025-04-01 00:00:00+00:00");

        let key = RowKey::for_row(&rows[0], KeyStrategy::FeatureTuple).unwrap();
        assert_eq!(table.update_persona(&key, 1).unwrap(), 1);
    }

    #[test]
    fn rejects_injection_in_table_name() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(SqliteFeatureTable::create(conn, "t; DROP TABLE x").is_err());
    }
}
