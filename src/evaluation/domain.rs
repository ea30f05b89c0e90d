//! Drift test contract and its result types.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::common::error::Result;
use crate::data::domain::{DatasetId, FeatureVector};

/// Per-column statistical test that was applied.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftMethod {
    /// Two-sample Kolmogorov-Smirnov; `statistic` holds the p-value.
    Ks,
    /// Wasserstein distance normed by the reference spread.
    Wasserstein,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ColumnDrift {
    pub column: String,
    pub method: DriftMethod,
    pub statistic: f64,
    pub drifted: bool,
}

/// Dataset-level outcome of a drift test.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DriftReport {
    pub is_drifted: bool,
    /// Fraction of feature columns flagged as drifted.
    pub drift_share: f64,
    pub columns: Vec<ColumnDrift>,
}

impl DriftReport {
    pub fn drifted_columns(&self) -> usize {
        self.columns.iter().filter(|c| c.drifted).count()
    }
}

/// Pluggable dataset drift test over feature columns only.
///
/// Implementations hold no state between calls.
pub trait DriftTest: Send + Sync {
    fn compare(&self, reference: &[FeatureVector], current: &[FeatureVector]) -> Result<DriftReport>;
}

/// Retrain gate produced by one comparison. Not persisted.
#[derive(Clone, Debug, Serialize)]
pub struct DriftVerdict {
    pub reference_id: DatasetId,
    pub current_id: DatasetId,
    pub is_drifted: bool,
    pub computed_at: DateTime<Utc>,
    pub report: DriftReport,
}
