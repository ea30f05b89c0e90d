//! Composite quality score for a fitted candidate.
//!
//! `score = silhouette * 1000 / inertia`. Higher is better: well separated
//! (high silhouette) and compact (low inertia). The 1000 factor only scales the
//! number; scores are comparable across runs as long as it stays fixed.

use thiserror::Error;

/// Normalisation constant. Changing it breaks comparability with stored runs.
pub const SCORE_SCALE: f64 = 1000.0;

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum ScoreError {
    /// Degenerate fit, e.g. every cluster collapsed onto its points.
    #[error("division by zero inertia")]
    ZeroInertia,
    #[error("inertia must be a finite non-negative number, got {0}")]
    InvalidInertia(f64),
    #[error("silhouette must lie in [-1, 1], got {0}")]
    SilhouetteOutOfRange(f64),
}

/// Score a candidate from its metrics.
pub fn score(inertia: f64, silhouette: f64) -> Result<f64, ScoreError> {
    if !inertia.is_finite() || inertia < 0.0 {
        return Err(ScoreError::InvalidInertia(inertia));
    }
    if inertia == 0.0 {
        return Err(ScoreError::ZeroInertia);
    }
    if !(-1.0..=1.0).contains(&silhouette) {
        return Err(ScoreError::SilhouetteOutOfRange(silhouette));
    }
    Ok(silhouette * SCORE_SCALE / inertia)
}
