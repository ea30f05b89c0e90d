//! Synthetic persona data: Gaussian blobs around three fixed centroids.

use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::common::error::{PersonaError, Result};

use super::domain::{FeatureVector, Record, FEATURE_COLUMNS};

/// Fixed persona centres shared by every generated month, so drift only comes
/// from changing the spread or the mix.
pub const CENTROIDS: [FeatureVector; 3] = [
    [
        -2.50919762, 9.01428613, 4.63987884, 1.97316968, -6.87962719, -6.88010959, -8.83832776,
        7.32352292, 2.02230023, 4.16145156,
    ],
    [
        -9.58831011, 9.39819704, 6.64885282, -5.75321779, -6.36350066, -6.3319098, -3.91515514,
        0.49512863, -1.36109963, -4.1754172,
    ],
    [
        2.23705789, -7.21012279, -4.15710703, -2.67276313, -0.87860032, 5.70351923, -6.00652436,
        0.28468877, 1.84829138, -9.07099175,
    ],
];

/// Generation parameters.
#[derive(Clone, Debug)]
pub struct BlobSpec {
    pub rows: usize,
    pub cluster_std: f64,
    pub seed: u64,
    pub year: i32,
    pub month: u32,
}

/// Generated rows plus the centroid each row was drawn from.
#[derive(Clone, Debug)]
pub struct Blobs {
    pub records: Vec<Record>,
    pub labels: Vec<usize>,
}

/// Draw `rows` points split evenly across the centroids, shuffled, all dated
/// on the first of the given month.
pub fn generate(spec: &BlobSpec) -> Result<Blobs> {
    let noise = Normal::new(0.0, spec.cluster_std)
        .ok()
        .filter(|_| spec.cluster_std.is_finite())
        .ok_or_else(|| PersonaError::invalid("cluster_std must be a non-negative number"))?;
    let date = NaiveDate::from_ymd_opt(spec.year, spec.month, 1).ok_or_else(|| {
        PersonaError::invalid(format!("invalid month {}-{}", spec.year, spec.month))
    })?;

    let mut rng = StdRng::seed_from_u64(spec.seed);
    let mut labels: Vec<usize> = (0..spec.rows).map(|i| i % CENTROIDS.len()).collect();
    labels.shuffle(&mut rng);

    let records = labels
        .iter()
        .map(|&label| {
            let mut features = CENTROIDS[label];
            for value in features.iter_mut() {
                *value += noise.sample(&mut rng);
            }
            Record::new(None, date, features)
        })
        .collect();

    Ok(Blobs { records, labels })
}

/// Write records in the `date,x1..x10` CSV layout.
pub fn write_csv(path: &Path, records: &[Record]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(std::iter::once("date").chain(FEATURE_COLUMNS))?;
    for record in records {
        let mut fields = Vec::with_capacity(FEATURE_COLUMNS.len() + 1);
        fields.push(record.date.to_string());
        fields.extend(record.features.iter().map(f64::to_string));
        writer.write_record(&fields)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(seed: u64) -> BlobSpec {
        BlobSpec {
            rows: 30,
            cluster_std: 1.0,
            seed,
            year: 2025,
            month: 6,
        }
    }

    #[test]
    fn same_seed_same_rows() {
        let a = generate(&spec(3)).unwrap();
        let b = generate(&spec(3)).unwrap();
        let c = generate(&spec(4)).unwrap();
        assert_eq!(a.records, b.records);
        assert_ne!(a.records, c.records);
    }

    #[test]
    fn rows_are_balanced_and_dated() {
        let blobs = generate(&spec(1)).unwrap();
        assert_eq!(blobs.records.len(), 30);
        for label in 0..3 {
            assert_eq!(blobs.labels.iter().filter(|&&l| l == label).count(), 10);
        }
        let june = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert!(blobs.records.iter().all(|r| r.date == june));
    }

    #[test]
    fn zero_spread_sits_on_centroids() {
        let mut s = spec(9);
        s.cluster_std = 0.0;
        let blobs = generate(&s).unwrap();
        for (record, label) in blobs.records.iter().zip(&blobs.labels) {
            assert_eq!(record.features, CENTROIDS[*label]);
        }
    }

    #[test]
    fn negative_spread_is_rejected() {
        let mut s = spec(2);
        s.cluster_std = -1.0;
        assert!(generate(&s).is_err());
        s.cluster_std = f64::NAN;
        assert!(generate(&s).is_err());
    }

    #[test]
    fn csv_output_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.csv");
        let blobs = generate(&spec(5)).unwrap();
        write_csv(&path, &blobs.records).unwrap();
        let dataset = crate::data::service::read_csv(&path).unwrap();
        assert_eq!(dataset.records(), blobs.records.as_slice());
    }
}
