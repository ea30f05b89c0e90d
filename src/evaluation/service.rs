//! Drift detection between a reference and a current dataset.

use tracing::info;

use crate::common::error::{PersonaError, Result};
use crate::common::time::now_utc;
use crate::data::domain::Dataset;

use super::domain::{DriftTest, DriftVerdict};

/// Compare feature columns of `current` against `reference`.
///
/// Dates, identities and labels never reach the test. Same inputs give the
/// same verdict; identical datasets are never drifted.
pub fn detect(test: &dyn DriftTest, reference: &Dataset, current: &Dataset) -> Result<DriftVerdict> {
    if reference.is_empty() || current.is_empty() {
        return Err(PersonaError::invalid(format!(
            "drift detection needs non-empty datasets (reference {} rows, current {} rows)",
            reference.len(),
            current.len()
        )));
    }

    let report = test.compare(&reference.features(), &current.features())?;

    info!(
        reference = %reference.id(),
        current = %current.id(),
        is_drifted = report.is_drifted,
        drift_share = report.drift_share,
        drifted_columns = report.drifted_columns(),
        "drift detection finished"
    );
    Ok(DriftVerdict {
        reference_id: reference.id().clone(),
        current_id: current.id().clone(),
        is_drifted: report.is_drifted,
        computed_at: now_utc(),
        report,
    })
}
