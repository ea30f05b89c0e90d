//! Batch scoring: label every row of a time window and write the labels back.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::common::error::{PersonaError, Result};
use crate::common::time::elapsed_ms;
use crate::data::domain::{FeatureVector, KeyStrategy, RowKey, ScoringTable, TimeWindow};

use super::domain::Predictor;

/// What one batch run did.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchSummary {
    pub table: String,
    pub window: String,
    pub strategy: KeyStrategy,
    pub rows_read: usize,
    pub rows_written: usize,
    /// Rows per persona label.
    pub persona_counts: BTreeMap<i64, usize>,
}

/// Bitwise key for duplicate detection; equal floats compare as stored.
fn tuple_key<'a>(features: &FeatureVector, stored_date: &'a str) -> ([u64; 10], &'a str) {
    let mut bits = [0u64; 10];
    for (b, v) in bits.iter_mut().zip(features) {
        *b = (v + 0.0).to_bits();
    }
    (bits, stored_date)
}

/// Score `window` of `table` with `predictor`.
///
/// Rows are keyed by `customer_id` when the table has one, else by the full
/// feature tuple plus date. The fallback refuses windows holding duplicate
/// tuples. A label count that differs from the row count aborts before any
/// write. Writes are one row per transaction and the run stops at the first
/// failure; rows already written stay written.
pub fn run(window: &TimeWindow, table: &dyn ScoringTable, predictor: &dyn Predictor) -> Result<BatchSummary> {
    let started = Instant::now();
    let window_label = window.to_string();
    let strategy = if table.has_identity()? {
        KeyStrategy::Identity
    } else {
        KeyStrategy::FeatureTuple
    };

    let rows = table.read_window(window)?;
    let mut summary = BatchSummary {
        table: table.name().to_string(),
        window: window_label.clone(),
        strategy,
        rows_read: rows.len(),
        rows_written: 0,
        persona_counts: BTreeMap::new(),
    };
    info!(table = table.name(), window = %window_label, rows = rows.len(), strategy = ?strategy, "batch scoring started");
    if rows.is_empty() {
        warn!(table = table.name(), window = %window_label, "no rows in window");
        return Ok(summary);
    }

    let keys = rows
        .iter()
        .map(|row| RowKey::for_row(row, strategy))
        .collect::<Result<Vec<_>>>()?;

    if strategy == KeyStrategy::FeatureTuple {
        let mut seen: HashMap<([u64; 10], &str), usize> = HashMap::new();
        for row in &rows {
            *seen.entry(tuple_key(&row.record.features, &row.stored_date)).or_default() += 1;
        }
        if let Some((idx, matches)) = rows.iter().enumerate().find_map(|(idx, row)| {
            let n = seen[&tuple_key(&row.record.features, &row.stored_date)];
            (n > 1).then_some((idx, n))
        }) {
            return Err(PersonaError::AmbiguousWriteBack {
                window: window_label,
                key: keys[idx].to_string(),
                matches,
            });
        }
    }

    let features: Vec<FeatureVector> = rows.iter().map(|r| r.record.features).collect();
    let labels = predictor.predict(&features)?;
    if labels.len() != rows.len() {
        error!(
            window = %window_label,
            expected = rows.len(),
            actual = labels.len(),
            "prediction shape mismatch, nothing written"
        );
        return Err(PersonaError::PredictionShapeMismatch {
            window: window_label,
            expected: rows.len(),
            actual: labels.len(),
        });
    }

    for (key, label) in keys.iter().zip(&labels) {
        let stop = |detail: String, written: usize| PersonaError::WriteBack {
            window: window_label.clone(),
            key: key.to_string(),
            written,
            detail,
        };
        let matched = table
            .update_persona(key, *label)
            .map_err(|err| stop(err.to_string(), summary.rows_written))?;
        match matched {
            1 => {
                summary.rows_written += 1;
                *summary.persona_counts.entry(*label).or_default() += 1;
            }
            0 => return Err(stop("row vanished before write-back".into(), summary.rows_written)),
            n => {
                return Err(PersonaError::AmbiguousWriteBack {
                    window: window_label.clone(),
                    key: key.to_string(),
                    matches: n,
                })
            }
        }
    }

    info!(
        table = table.name(),
        window = %window_label,
        rows_written = summary.rows_written,
        personas = ?summary.persona_counts,
        dur_ms = elapsed_ms(started),
        "batch scoring finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::domain::{Record, ScoringRow};
    use crate::data::repo_sqlite::SqliteFeatureTable;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use rusqlite::Connection;

    struct Fixed(Vec<i64>);

    impl Predictor for Fixed {
        fn predict(&self, _rows: &[FeatureVector]) -> Result<Vec<i64>> {
            Ok(self.0.clone())
        }
    }

    struct Parity;

    impl Predictor for Parity {
        fn predict(&self, rows: &[FeatureVector]) -> Result<Vec<i64>> {
            Ok(rows.iter().map(|r| (r[0] as i64) % 2).collect())
        }
    }

    fn april(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 4, day).unwrap()
    }

    fn identity_table(n: usize) -> SqliteFeatureTable {
        let table = SqliteFeatureTable::create(Connection::open_in_memory().unwrap(), "scores").unwrap();
        let records: Vec<Record> = (0..n)
            .map(|i| Record::new(None, april(1 + (i as u32 % 28)), [i as f64; 10]))
            .collect();
        table.insert(&records).unwrap();
        table
    }

    #[test]
    fn labels_land_on_their_rows() {
        let table = identity_table(6);
        let window = TimeWindow::month(2025, 4).unwrap();
        let summary = run(&window, &table, &Parity).unwrap();
        assert_eq!(summary.strategy, KeyStrategy::Identity);
        assert_eq!(summary.rows_written, 6);
        assert_eq!(summary.persona_counts, BTreeMap::from([(0, 3), (1, 3)]));
        for row in table.read_window(&window).unwrap() {
            assert_eq!(row.persona, Some((row.record.features[0] as i64) % 2));
        }
    }

    #[test]
    fn short_prediction_writes_nothing() {
        let table = identity_table(10);
        let window = TimeWindow::month(2025, 4).unwrap();
        let err = run(&window, &table, &Fixed(vec![1; 9])).unwrap_err();
        assert!(matches!(
            err,
            PersonaError::PredictionShapeMismatch { expected: 10, actual: 9, .. }
        ));
        assert!(table.read_window(&window).unwrap().iter().all(|r| r.persona.is_none()));
    }

    #[test]
    fn empty_window_skips_prediction() {
        let table = identity_table(3);
        let window = TimeWindow::month(2025, 5).unwrap();
        let summary = run(&window, &table, &Fixed(vec![])).unwrap();
        assert_eq!(summary.rows_read, 0);
        assert_eq!(summary.rows_written, 0);
    }

    /// Table double that fails on one key.
    struct Flaky {
        rows: Vec<ScoringRow>,
        fail_on: i64,
        written: Mutex<Vec<(i64, i64)>>,
    }

    impl ScoringTable for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn has_identity(&self) -> Result<bool> {
            Ok(true)
        }
        fn read_window(&self, _window: &TimeWindow) -> Result<Vec<ScoringRow>> {
            Ok(self.rows.clone())
        }
        fn update_persona(&self, key: &RowKey, persona: i64) -> Result<usize> {
            match key {
                RowKey::CustomerId(id) if *id == self.fail_on => Err(PersonaError::invalid("disk full")),
                RowKey::CustomerId(id) => {
                    self.written.lock().push((*id, persona));
                    Ok(1)
                }
                RowKey::Features { .. } => Ok(0),
            }
        }
    }

    #[test]
    fn first_write_failure_stops_the_batch() {
        let rows = (1..=5)
            .map(|id| ScoringRow::unlabelled(Record::new(Some(id), april(2), [id as f64; 10])))
            .collect();
        let table = Flaky {
            rows,
            fail_on: 3,
            written: Mutex::new(Vec::new()),
        };
        let err = run(&TimeWindow::month(2025, 4).unwrap(), &table, &Fixed(vec![7; 5])).unwrap_err();
        match err {
            PersonaError::WriteBack { written, key, window, .. } => {
                assert_eq!(written, 2);
                assert_eq!(key, "customer_id=3");
                assert_eq!(window, "2025-04");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*table.written.lock(), vec![(1, 7), (2, 7)]);
    }
}
