//! Lloyd's k-means with k-means++ seeding, plus the silhouette coefficient.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::error::{PersonaError, Result};
use crate::data::domain::{FeatureVector, N_FEATURES};

use super::domain::{squared_distance, ClusterModel, Clusterer, FittedClustering};

/// k-means clusterer keeping the best of `n_init` seeded restarts.
#[derive(Clone, Debug)]
pub struct KMeans {
    pub n_init: usize,
    pub max_iter: usize,
    /// Relative tolerance on centroid movement, scaled by the data variance.
    pub tol: f64,
}

impl Default for KMeans {
    fn default() -> Self {
        Self {
            n_init: 10,
            max_iter: 300,
            tol: 1e-4,
        }
    }
}

impl KMeans {
    pub fn new(n_init: usize, max_iter: usize) -> Self {
        Self {
            n_init: n_init.max(1),
            max_iter: max_iter.max(1),
            ..Self::default()
        }
    }
}

/// Per-k random stream so parallel fits of different k stay independent and
/// reproducible.
fn rng_for(seed: Option<u64>, k: usize) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ (k as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        None => StdRng::from_os_rng(),
    }
}

fn distinct_points(data: &[FeatureVector]) -> usize {
    let mut keys: Vec<[u64; N_FEATURES]> = data
        .iter()
        .map(|p| {
            let mut key = [0u64; N_FEATURES];
            for (slot, v) in key.iter_mut().zip(p) {
                // Fold -0.0 onto 0.0.
                *slot = (v + 0.0).to_bits();
            }
            key
        })
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys.len()
}

fn mean_variance(data: &[FeatureVector]) -> f64 {
    let n = data.len() as f64;
    let mut total = 0.0;
    for dim in 0..N_FEATURES {
        let mean = data.iter().map(|p| p[dim]).sum::<f64>() / n;
        total += data.iter().map(|p| (p[dim] - mean).powi(2)).sum::<f64>() / n;
    }
    total / N_FEATURES as f64
}

fn plus_plus_init(data: &[FeatureVector], k: usize, rng: &mut StdRng) -> Vec<FeatureVector> {
    let mut centers = Vec::with_capacity(k);
    centers.push(data[rng.random_range(0..data.len())]);
    let mut closest: Vec<f64> = data.iter().map(|p| squared_distance(p, &centers[0])).collect();

    while centers.len() < k {
        let total: f64 = closest.iter().sum();
        let next = if total > 0.0 {
            let target = rng.random::<f64>() * total;
            let mut acc = 0.0;
            let mut pick = data.len() - 1;
            for (idx, d) in closest.iter().enumerate() {
                acc += d;
                if acc >= target && *d > 0.0 {
                    pick = idx;
                    break;
                }
            }
            pick
        } else {
            rng.random_range(0..data.len())
        };
        let center = data[next];
        for (d, p) in closest.iter_mut().zip(data) {
            *d = d.min(squared_distance(p, &center));
        }
        centers.push(center);
    }
    centers
}

fn assign_all(data: &[FeatureVector], centers: &[FeatureVector], labels: &mut [usize]) -> f64 {
    let mut inertia = 0.0;
    for (label, point) in labels.iter_mut().zip(data) {
        let mut best = 0;
        let mut best_dist = f64::INFINITY;
        for (idx, c) in centers.iter().enumerate() {
            let d = squared_distance(point, c);
            if d < best_dist {
                best = idx;
                best_dist = d;
            }
        }
        *label = best;
        inertia += best_dist;
    }
    inertia
}

fn lloyd(
    data: &[FeatureVector],
    mut centers: Vec<FeatureVector>,
    max_iter: usize,
    tol: f64,
) -> (Vec<FeatureVector>, Vec<usize>, f64) {
    let k = centers.len();
    let mut labels = vec![0usize; data.len()];

    for _ in 0..max_iter {
        assign_all(data, &centers, &mut labels);

        let mut sums = vec![[0.0; N_FEATURES]; k];
        let mut counts = vec![0usize; k];
        for (label, point) in labels.iter().zip(data) {
            counts[*label] += 1;
            for (s, v) in sums[*label].iter_mut().zip(point) {
                *s += v;
            }
        }

        let mut next = centers.clone();
        for c in 0..k {
            if counts[c] == 0 {
                // Re-seed an empty cluster at the point farthest from its centre.
                let far = labels
                    .iter()
                    .zip(data)
                    .enumerate()
                    .max_by(|(_, (la, pa)), (_, (lb, pb))| {
                        squared_distance(pa, &centers[**la])
                            .total_cmp(&squared_distance(pb, &centers[**lb]))
                    })
                    .map(|(idx, _)| idx)
                    .unwrap_or(0);
                next[c] = data[far];
            } else {
                for (dst, s) in next[c].iter_mut().zip(&sums[c]) {
                    *dst = s / counts[c] as f64;
                }
            }
        }

        let shift: f64 = centers
            .iter()
            .zip(&next)
            .map(|(a, b)| squared_distance(a, b))
            .sum();
        centers = next;
        if shift <= tol {
            break;
        }
    }

    let inertia = assign_all(data, &centers, &mut labels);
    (centers, labels, inertia)
}

impl Clusterer for KMeans {
    fn fit(&self, data: &[FeatureVector], k: usize, seed: Option<u64>) -> Result<FittedClustering> {
        let invalid = |reason: String| PersonaError::InvalidCandidate { k, reason };
        if k == 0 {
            return Err(invalid("k must be positive".into()));
        }
        if data.len() < k {
            return Err(invalid(format!("k exceeds the {} available samples", data.len())));
        }
        let distinct = distinct_points(data);
        if distinct < k {
            return Err(invalid(format!("only {distinct} distinct samples")));
        }

        let tol = self.tol * mean_variance(data);
        let mut rng = rng_for(seed, k);
        let mut best: Option<(Vec<FeatureVector>, Vec<usize>, f64)> = None;
        for _ in 0..self.n_init.max(1) {
            let init = plus_plus_init(data, k, &mut rng);
            let run = lloyd(data, init, self.max_iter, tol);
            let better = best.as_ref().map(|b| run.2 < b.2).unwrap_or(true);
            if better {
                best = Some(run);
            }
        }

        let (centers, assignments, inertia) =
            best.ok_or_else(|| invalid("no initialisation ran".into()))?;
        Ok(FittedClustering {
            model: ClusterModel::new(centers)?,
            assignments,
            inertia,
        })
    }
}

/// Mean silhouette coefficient over all samples (Euclidean distance).
///
/// Defined only for `2 <= clusters <= n - 1`. Samples alone in their cluster
/// contribute 0.
pub fn silhouette(data: &[FeatureVector], labels: &[usize]) -> Result<f64> {
    if data.len() != labels.len() {
        return Err(PersonaError::invalid(format!(
            "{} samples but {} labels",
            data.len(),
            labels.len()
        )));
    }
    let k = labels.iter().copied().max().map(|m| m + 1).unwrap_or(0);
    let mut sizes = vec![0usize; k];
    for &l in labels {
        sizes[l] += 1;
    }
    let used = sizes.iter().filter(|&&s| s > 0).count();
    if used < 2 || used >= data.len() {
        return Err(PersonaError::InvalidCandidate {
            k: used,
            reason: format!(
                "silhouette undefined for {used} clusters over {} samples",
                data.len()
            ),
        });
    }

    let mut total = 0.0;
    let mut dist_sums = vec![0.0; k];
    for (i, p) in data.iter().enumerate() {
        dist_sums.iter_mut().for_each(|d| *d = 0.0);
        for (j, q) in data.iter().enumerate() {
            if i != j {
                dist_sums[labels[j]] += squared_distance(p, q).sqrt();
            }
        }
        let own = labels[i];
        if sizes[own] <= 1 {
            continue;
        }
        let a = dist_sums[own] / (sizes[own] - 1) as f64;
        let b = (0..k)
            .filter(|&c| c != own && sizes[c] > 0)
            .map(|c| dist_sums[c] / sizes[c] as f64)
            .fold(f64::INFINITY, f64::min);
        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }
    Ok(total / data.len() as f64)
}
