//! Dataset ingestion: CSV parsing and loading into feature tables.
//!
//! Files follow the generator's layout: a `date` column, `x1..x10`, and
//! optionally `customer_id` and `persona`. Column order is taken from the
//! header, extra columns are ignored.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Instant;

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::error::{PersonaError, Result};
use crate::common::time;

use super::domain::{Dataset, DatasetId, FeatureVector, Record, ScoringTable, FEATURE_COLUMNS};
use super::repo_sqlite::SqliteFeatureTable;

/// Outcome of loading a file into a feature table.
#[derive(Clone, Debug, Serialize)]
pub struct IngestReport {
    pub table: String,
    pub dataset_id: DatasetId,
    pub rows: usize,
}

/// One CSV line, matched to columns by header name.
#[derive(Debug, Deserialize)]
struct CsvRow {
    date: String,
    #[serde(default)]
    customer_id: Option<i64>,
    x1: f64,
    x2: f64,
    x3: f64,
    x4: f64,
    x5: f64,
    x6: f64,
    x7: f64,
    x8: f64,
    x9: f64,
    x10: f64,
}

impl CsvRow {
    fn into_record(self, line: u64) -> Result<Record> {
        let features: FeatureVector = [
            self.x1, self.x2, self.x3, self.x4, self.x5, self.x6, self.x7, self.x8, self.x9,
            self.x10,
        ];
        if let Some(idx) = features.iter().position(|v| !v.is_finite()) {
            return Err(PersonaError::invalid(format!(
                "line {line}: {} is not finite",
                FEATURE_COLUMNS[idx]
            )));
        }
        let date = parse_date(&self.date)
            .map_err(|err| PersonaError::invalid(format!("line {line}: {err}")))?;
        Ok(Record::new(self.customer_id, date, features))
    }
}

/// Parse a date cell; timestamps such as `2025-04-01 00:00:00+00:00` keep
/// their calendar day.
pub fn parse_date(cell: &str) -> Result<NaiveDate> {
    let cell = cell.trim();
    let day = cell.get(..10).unwrap_or(cell);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|_| PersonaError::invalid(format!("unparseable date '{cell}'")))
}

/// Parse CSV content into records. Columns are found by header name; extra
/// columns such as `persona` are ignored.
pub fn parse_csv<R: Read>(reader: R) -> Result<Vec<Record>> {
    let mut reader = ReaderBuilder::new().trim(Trim::All).from_reader(reader);
    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(PersonaError::invalid("CSV input is empty"));
    }
    for name in std::iter::once("date").chain(FEATURE_COLUMNS) {
        if !headers.iter().any(|h| h == name) {
            return Err(PersonaError::invalid(format!("CSV header lacks '{name}'")));
        }
    }

    let mut records = Vec::new();
    let mut raw = StringRecord::new();
    while reader.read_record(&mut raw)? {
        let line = raw.position().map(|p| p.line()).unwrap_or_default();
        let row: CsvRow = raw
            .deserialize(Some(&headers))
            .map_err(|err| PersonaError::invalid(format!("line {line}: {err}")))?;
        records.push(row.into_record(line)?);
    }
    Ok(records)
}

/// Read a CSV file as a dataset.
pub fn read_csv(path: &Path) -> Result<Dataset> {
    let records = parse_csv(File::open(path)?)?;
    if records.is_empty() {
        return Err(PersonaError::invalid(format!(
            "{} contains no rows",
            path.display()
        )));
    }
    Ok(Dataset::new(records))
}

/// Append a CSV file to a feature table. Identity keys are assigned by the
/// table; any `customer_id` column in the file is not trusted as a key.
pub fn ingest_file(path: &Path, table: &SqliteFeatureTable) -> Result<IngestReport> {
    let started = Instant::now();
    let dataset = read_csv(path)?;
    let rows = table.insert(dataset.records())?;
    info!(
        table = table.name(),
        dataset_id = %dataset.id(),
        rows,
        dur_ms = time::elapsed_ms(started),
        "dataset ingested"
    );
    Ok(IngestReport {
        table: table.name().to_string(),
        dataset_id: dataset.id().clone(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
date,x1,x2,x3,x4,x5,x6,x7,x8,x9,x10
2025-04-01,1,2,3,4,5,6,7,8,9,10
2025-04-01 00:00:00+00:00,-1.5,0,0,0,0,0,0,0,0,0.25
";

    #[test]
    fn parses_generator_layout() {
        let records = parse_csv(SAMPLE.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].features[9], 10.0);
        assert_eq!(records[1].features[0], -1.5);
        assert_eq!(records[1].date, NaiveDate::from_ymd_opt(2025, 4, 1).unwrap());
        assert!(records.iter().all(|r| r.customer_id.is_none()));
    }

    #[test]
    fn header_order_is_respected() {
        let csv = "\
customer_id,x10,x9,x8,x7,x6,x5,x4,x3,x2,x1,date,persona
7,10,9,8,7,6,5,4,3,2,1,2025-05-02,
";
        let records = parse_csv(csv.as_bytes()).unwrap();
        assert_eq!(records[0].customer_id, Some(7));
        assert_eq!(records[0].features, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
    }

    #[test]
    fn quoted_fields_are_accepted() {
        let csv = "\
\"date\",\"x1\",\"x2\",\"x3\",\"x4\",\"x5\",\"x6\",\"x7\",\"x8\",\"x9\",\"x10\"
\"2025-04-01 00:00:00+00:00\",\"1.5\",2,3,4,5,6,7,8,9,10
";
        let records = parse_csv(csv.as_bytes()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].features[0], 1.5);
        assert_eq!(records[0].date, NaiveDate::from_ymd_opt(2025, 4, 1).unwrap());
    }

    #[test]
    fn ingest_reports_table_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("april.csv");
        std::fs::write(&path, SAMPLE).unwrap();
        let table = SqliteFeatureTable::create(rusqlite::Connection::open_in_memory().unwrap(), "customers")
            .unwrap();
        let report = ingest_file(&path, &table).unwrap();
        assert_eq!(report.table, "customers");
        assert_eq!(report.rows, 2);
        let window = crate::data::domain::TimeWindow::month(2025, 4).unwrap();
        assert_eq!(table.read_window(&window).unwrap().len(), 2);
    }

    #[test]
    fn rejects_missing_feature_column() {
        let csv = "date,x1,x2\n2025-04-01,1,2\n";
        let err = parse_csv(csv.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("x3"));
    }

    #[test]
    fn rejects_non_numeric_cell() {
        let csv = "date,x1,x2,x3,x4,x5,x6,x7,x8,x9,x10\n2025-04-01,a,2,3,4,5,6,7,8,9,10\n";
        let err = parse_csv(csv.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
