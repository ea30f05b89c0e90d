//! Core dataset definitions and the storage contract used by batch scoring.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::common::error::{PersonaError, Result};
use crate::common::ids::Fingerprint;

/// Number of numeric features per record.
pub const N_FEATURES: usize = 10;

/// Fixed column order of the feature vector.
pub const FEATURE_COLUMNS: [&str; N_FEATURES] =
    ["x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10"];

/// One row of features in `x1..x10` order.
pub type FeatureVector = [f64; N_FEATURES];

/// Content-derived dataset identifier.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub customer_id: Option<i64>,
    pub date: NaiveDate,
    pub features: FeatureVector,
}

impl Record {
    pub fn new(customer_id: Option<i64>, date: NaiveDate, features: FeatureVector) -> Self {
        Self {
            customer_id,
            date,
            features,
        }
    }
}

/// Ordered collection of records sharing the `x1..x10` schema.
///
/// The id is a fingerprint of features and dates only: identity keys and
/// labels do not change what the drift test or the clusterer sees.
#[derive(Clone, Debug)]
pub struct Dataset {
    id: DatasetId,
    records: Vec<Record>,
}

impl Dataset {
    pub fn new(records: Vec<Record>) -> Self {
        let mut hasher = Fingerprint::new();
        for record in &records {
            for value in record.features {
                hasher.update_f64(value);
            }
            hasher.update(record.date.to_string().as_bytes());
        }
        Self {
            id: DatasetId(format!("ds-{}", hasher.finish_short())),
            records,
        }
    }

    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `(rows, feature columns)`, recorded as search provenance.
    pub fn shape(&self) -> (usize, usize) {
        (self.records.len(), N_FEATURES)
    }

    /// Feature matrix with date and identity columns dropped.
    pub fn features(&self) -> Vec<FeatureVector> {
        self.records.iter().map(|r| r.features).collect()
    }
}

/// Half-open date range `[start, end)` used for windowed reads.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start >= end {
            return Err(PersonaError::invalid(format!(
                "empty window: {start} is not before {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Calendar month window, as the monthly batch job uses.
    pub fn month(year: i32, month: u32) -> Result<Self> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| PersonaError::invalid(format!("invalid month {year}-{month}")))?;
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        let end = NaiveDate::from_ymd_opt(next_year, next_month, 1)
            .ok_or_else(|| PersonaError::invalid(format!("invalid month {year}-{month}")))?;
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let is_month = self.start.day() == 1
            && TimeWindow::month(self.start.year(), self.start.month())
                .map(|m| m.end == self.end)
                .unwrap_or(false);
        if is_month {
            write!(f, "{:04}-{:02}", self.start.year(), self.start.month())
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

/// A stored row as read for batch scoring.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoringRow {
    pub record: Record,
    /// Date cell exactly as stored; tables loaded elsewhere may hold full
    /// timestamps such as `2025-04-01 00:00:00+00:00`.
    pub stored_date: String,
    pub persona: Option<i64>,
}

impl ScoringRow {
    /// Row whose stored date is the plain calendar day.
    pub fn unlabelled(record: Record) -> Self {
        Self {
            stored_date: record.date.to_string(),
            record,
            persona: None,
        }
    }
}

/// How one row is addressed for the label write-back.
#[derive(Clone, Debug, PartialEq)]
pub enum RowKey {
    CustomerId(i64),
    /// Value-equality match on every feature plus the stored date text. Only
    /// safe when the tuple is unique within the table.
    Features {
        features: FeatureVector,
        date: String,
    },
}

impl RowKey {
    /// Key for a stored row under the given strategy.
    pub fn for_row(row: &ScoringRow, strategy: KeyStrategy) -> Result<Self> {
        match strategy {
            KeyStrategy::Identity => row.record.customer_id.map(RowKey::CustomerId).ok_or_else(|| {
                PersonaError::invalid(format!(
                    "row dated {} has no customer_id in an identity-keyed table",
                    row.stored_date
                ))
            }),
            KeyStrategy::FeatureTuple => Ok(RowKey::Features {
                features: row.record.features,
                date: row.stored_date.clone(),
            }),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::CustomerId(id) => write!(f, "customer_id={id}"),
            RowKey::Features { features, date } => {
                write!(f, "(date={date}, x1={}, x2={}, ..)", features[0], features[1])
            }
        }
    }
}

/// Write-back matching strategy chosen from the table schema.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    Identity,
    FeatureTuple,
}

/// Storage contract for feature tables.
///
/// `update_persona` must be atomic per row and report how many rows the key
/// matched; implementations refuse to touch more than one row.
pub trait ScoringTable {
    fn name(&self) -> &str;
    fn has_identity(&self) -> Result<bool>;
    fn read_window(&self, window: &TimeWindow) -> Result<Vec<ScoringRow>>;
    fn update_persona(&self, key: &RowKey, persona: i64) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn month_window_is_half_open() {
        let april = TimeWindow::month(2025, 4).unwrap();
        assert!(april.contains(date(2025, 4, 1)));
        assert!(april.contains(date(2025, 4, 30)));
        assert!(!april.contains(date(2025, 5, 1)));
        assert!(!april.contains(date(2025, 3, 31)));
        assert_eq!(april.to_string(), "2025-04");

        let december = TimeWindow::month(2024, 12).unwrap();
        assert_eq!(december.end, date(2025, 1, 1));
        assert!(TimeWindow::month(2025, 13).is_err());
    }

    #[test]
    fn arbitrary_window_displays_range() {
        let w = TimeWindow::new(date(2025, 4, 3), date(2025, 4, 10)).unwrap();
        assert_eq!(w.to_string(), "2025-04-03..2025-04-10");
        assert!(TimeWindow::new(date(2025, 4, 3), date(2025, 4, 3)).is_err());
    }

    #[test]
    fn dataset_id_ignores_identity_keys() {
        let a = Dataset::new(vec![Record::new(Some(1), date(2025, 4, 1), [1.0; N_FEATURES])]);
        let b = Dataset::new(vec![Record::new(None, date(2025, 4, 1), [1.0; N_FEATURES])]);
        let c = Dataset::new(vec![Record::new(None, date(2025, 4, 1), [2.0; N_FEATURES])]);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.shape(), (1, 10));
    }

    #[test]
    fn identity_key_requires_customer_id() {
        let row = ScoringRow::unlabelled(Record::new(None, date(2025, 4, 1), [0.0; N_FEATURES]));
        assert!(RowKey::for_row(&row, KeyStrategy::Identity).is_err());
        assert!(matches!(
            RowKey::for_row(&row, KeyStrategy::FeatureTuple),
            Ok(RowKey::Features { .. })
        ));
    }

    #[test]
    fn tuple_key_keeps_stored_date_text() {
        let row = ScoringRow {
            record: Record::new(None, date(2025, 4, 1), [0.0; N_FEATURES]),
            stored_date: "2025-04-01 00:00:00+00:00".into(),
            persona: None,
        };
        match RowKey::for_row(&row, KeyStrategy::FeatureTuple).unwrap() {
            RowKey::Features { date, .. } => assert_eq!(date, "2025-04-01 00:00:00+00:00"),
            other => panic!("unexpected key {other}"),
        }
    }
}
