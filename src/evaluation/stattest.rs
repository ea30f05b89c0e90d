//! Column-wise statistical drift test.
//!
//! Small references (up to `ks_max_rows`) use the two-sample KS test and flag
//! a column when its p-value is at or below `stattest_threshold`. Larger
//! references use the Wasserstein distance divided by the reference standard
//! deviation and flag a column at or above `wasserstein_threshold`. The
//! dataset drifts when the flagged share reaches `drift_share`.

use crate::common::config::DriftCfg;
use crate::common::error::{PersonaError, Result};
use crate::data::domain::{FeatureVector, FEATURE_COLUMNS, N_FEATURES};

use super::domain::{ColumnDrift, DriftMethod, DriftReport, DriftTest};

/// Floor for the reference spread so constant columns do not divide by zero.
const MIN_STD: f64 = 0.001;

#[derive(Clone, Debug)]
pub struct StatTestDrift {
    cfg: DriftCfg,
}

impl StatTestDrift {
    pub fn new(cfg: DriftCfg) -> Self {
        Self { cfg }
    }
}

impl Default for StatTestDrift {
    fn default() -> Self {
        Self::new(DriftCfg::default())
    }
}

fn sorted_column(rows: &[FeatureVector], dim: usize) -> Vec<f64> {
    let mut col: Vec<f64> = rows.iter().map(|r| r[dim]).collect();
    col.sort_by(f64::total_cmp);
    col
}

/// Largest gap between the two empirical CDFs. Inputs must be sorted.
pub fn ks_statistic(a: &[f64], b: &[f64]) -> f64 {
    let (n, m) = (a.len() as f64, b.len() as f64);
    let (mut i, mut j) = (0usize, 0usize);
    let mut d: f64 = 0.0;
    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        d = d.max((i as f64 / n - j as f64 / m).abs());
    }
    d
}

/// Asymptotic two-sided p-value of the KS statistic `d`.
pub fn ks_p_value(d: f64, n: usize, m: usize) -> f64 {
    if d <= 0.0 {
        return 1.0;
    }
    let en = ((n * m) as f64 / (n + m) as f64).sqrt();
    let lambda = (en + 0.12 + 0.11 / en) * d;
    let a2 = -2.0 * lambda * lambda;
    let mut sum = 0.0;
    let mut sign = 2.0;
    let mut prev_term = 0.0;
    for j in 1..=100 {
        let term = sign * (a2 * (j * j) as f64).exp();
        sum += term;
        if term.abs() <= 1e-3 * prev_term || term.abs() <= 1e-8 * sum {
            return sum.clamp(0.0, 1.0);
        }
        sign = -sign;
        prev_term = term.abs();
    }
    // Series failed to converge: only happens for tiny lambda, i.e. no drift.
    1.0
}

/// First Wasserstein distance between two empirical distributions. Inputs
/// must be sorted.
pub fn wasserstein(a: &[f64], b: &[f64]) -> f64 {
    let (n, m) = (a.len() as f64, b.len() as f64);
    let mut all: Vec<f64> = a.iter().chain(b).copied().collect();
    all.sort_by(f64::total_cmp);

    let (mut i, mut j) = (0usize, 0usize);
    let mut total = 0.0;
    for w in all.windows(2) {
        let x = w[0];
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        total += (i as f64 / n - j as f64 / m).abs() * (w[1] - w[0]);
    }
    total
}

fn std_dev(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

impl DriftTest for StatTestDrift {
    fn compare(&self, reference: &[FeatureVector], current: &[FeatureVector]) -> Result<DriftReport> {
        if reference.is_empty() || current.is_empty() {
            return Err(PersonaError::invalid(format!(
                "drift test needs rows on both sides (reference {}, current {})",
                reference.len(),
                current.len()
            )));
        }

        let method = if reference.len() <= self.cfg.ks_max_rows {
            DriftMethod::Ks
        } else {
            DriftMethod::Wasserstein
        };

        let columns: Vec<ColumnDrift> = (0..N_FEATURES)
            .map(|dim| {
                let r = sorted_column(reference, dim);
                let c = sorted_column(current, dim);
                let (statistic, drifted) = match method {
                    DriftMethod::Ks => {
                        let p = ks_p_value(ks_statistic(&r, &c), r.len(), c.len());
                        (p, p <= self.cfg.stattest_threshold)
                    }
                    DriftMethod::Wasserstein => {
                        let norm = wasserstein(&r, &c) / std_dev(&r).max(MIN_STD);
                        (norm, norm >= self.cfg.wasserstein_threshold)
                    }
                };
                ColumnDrift {
                    column: FEATURE_COLUMNS[dim].to_string(),
                    method,
                    statistic,
                    drifted,
                }
            })
            .collect();

        let drifted = columns.iter().filter(|c| c.drifted).count();
        let drift_share = drifted as f64 / N_FEATURES as f64;
        Ok(DriftReport {
            is_drifted: drift_share >= self.cfg.drift_share,
            drift_share,
            columns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(offset: f64, n: usize) -> Vec<FeatureVector> {
        (0..n).map(|i| [offset + i as f64 / n as f64; N_FEATURES]).collect()
    }

    #[test]
    fn ks_statistic_matches_hand_computation() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [3.0, 4.0, 5.0, 6.0];
        assert!((ks_statistic(&a, &b) - 0.5).abs() < 1e-12);
        assert_eq!(ks_statistic(&a, &a), 0.0);
    }

    #[test]
    fn p_value_shrinks_with_separation() {
        assert_eq!(ks_p_value(0.0, 50, 50), 1.0);
        let near = ks_p_value(0.1, 50, 50);
        let far = ks_p_value(0.6, 50, 50);
        assert!(near > 0.5, "near {near}");
        assert!(far < 1e-6, "far {far}");
    }

    #[test]
    fn wasserstein_of_a_shift_is_the_shift() {
        let a = [0.0, 1.0, 2.0, 3.0];
        let b = [0.5, 1.5, 2.5, 3.5];
        assert!((wasserstein(&a, &b) - 0.5).abs() < 1e-12);
        assert_eq!(wasserstein(&a, &a), 0.0);
    }

    #[test]
    fn identical_data_never_drifts() {
        let data = rows(0.0, 200);
        let test = StatTestDrift::default();
        let report = test.compare(&data, &data).unwrap();
        assert!(!report.is_drifted);
        assert_eq!(report.drifted_columns(), 0);
        assert!(report.columns.iter().all(|c| c.method == DriftMethod::Ks));
    }

    #[test]
    fn shifted_data_drifts_under_both_methods() {
        let reference = rows(0.0, 300);
        let current = rows(5.0, 300);
        let ks = StatTestDrift::default().compare(&reference, &current).unwrap();
        assert!(ks.is_drifted);
        assert_eq!(ks.drift_share, 1.0);

        let cfg = DriftCfg {
            ks_max_rows: 10,
            ..DriftCfg::default()
        };
        let wd = StatTestDrift::new(cfg).compare(&reference, &current).unwrap();
        assert!(wd.is_drifted);
        assert!(wd.columns.iter().all(|c| c.method == DriftMethod::Wasserstein));
    }

    #[test]
    fn empty_side_is_rejected() {
        assert!(StatTestDrift::default().compare(&[], &rows(0.0, 3)).is_err());
    }
}
