//! Domain types for candidate search and run history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::error::{PersonaError, Result};
use crate::common::ids::RunId;
use crate::data::domain::FeatureVector;

use super::score;

/// Fitted clustering state: one centroid per cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterModel {
    centroids: Vec<FeatureVector>,
}

impl ClusterModel {
    pub fn new(centroids: Vec<FeatureVector>) -> Result<Self> {
        if centroids.is_empty() {
            return Err(PersonaError::invalid("cluster model needs at least one centroid"));
        }
        if centroids.iter().flatten().any(|v| !v.is_finite()) {
            return Err(PersonaError::invalid("cluster model has non-finite centroid"));
        }
        Ok(Self { centroids })
    }

    pub fn k(&self) -> usize {
        self.centroids.len()
    }

    pub fn centroids(&self) -> &[FeatureVector] {
        &self.centroids
    }

    /// Index of the nearest centroid; ties go to the lower index.
    pub fn assign(&self, point: &FeatureVector) -> usize {
        let mut best = 0;
        let mut best_dist = f64::INFINITY;
        for (idx, centroid) in self.centroids.iter().enumerate() {
            let dist = squared_distance(point, centroid);
            if dist < best_dist {
                best = idx;
                best_dist = dist;
            }
        }
        best
    }

    pub fn predict(&self, points: &[FeatureVector]) -> Vec<usize> {
        points.iter().map(|p| self.assign(p)).collect()
    }
}

pub fn squared_distance(a: &FeatureVector, b: &FeatureVector) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Output of one clustering fit.
#[derive(Clone, Debug)]
pub struct FittedClustering {
    pub model: ClusterModel,
    pub assignments: Vec<usize>,
    /// Sum of squared distances of points to their assigned centroid.
    pub inertia: f64,
}

/// Pluggable clustering capability.
pub trait Clusterer: Send + Sync {
    /// Fit `k` clusters. With `seed` set, the same inputs must give
    /// bit-identical output.
    fn fit(&self, data: &[FeatureVector], k: usize, seed: Option<u64>) -> Result<FittedClustering>;
}

/// One scored clustering model for a specific cluster count.
///
/// The score is always derived from inertia and silhouette; deserialising a
/// stored candidate recomputes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CandidateRepr")]
pub struct Candidate {
    cluster_count: usize,
    model: ClusterModel,
    inertia: f64,
    silhouette: f64,
    score: f64,
}

#[derive(Deserialize)]
struct CandidateRepr {
    cluster_count: usize,
    model: ClusterModel,
    inertia: f64,
    silhouette: f64,
}

impl TryFrom<CandidateRepr> for Candidate {
    type Error = PersonaError;

    fn try_from(repr: CandidateRepr) -> Result<Self> {
        Candidate::new(repr.cluster_count, repr.model, repr.inertia, repr.silhouette)
    }
}

impl Candidate {
    pub fn new(
        cluster_count: usize,
        model: ClusterModel,
        inertia: f64,
        silhouette: f64,
    ) -> Result<Self> {
        let invalid = |reason: String| PersonaError::InvalidCandidate {
            k: cluster_count,
            reason,
        };
        if cluster_count == 0 {
            return Err(invalid("cluster count must be positive".into()));
        }
        if model.k() != cluster_count {
            return Err(invalid(format!("model has {} centroids", model.k())));
        }
        let score = score::score(inertia, silhouette).map_err(|err| invalid(err.to_string()))?;
        Ok(Self {
            cluster_count,
            model,
            inertia,
            silhouette,
            score,
        })
    }

    pub fn cluster_count(&self) -> usize {
        self.cluster_count
    }

    pub fn model(&self) -> &ClusterModel {
        &self.model
    }

    pub fn inertia(&self) -> f64 {
        self.inertia
    }

    pub fn silhouette(&self) -> f64 {
        self.silhouette
    }

    pub fn score(&self) -> f64 {
        self.score
    }
}

/// Parent record of one search; provenance for all its candidates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchRun {
    pub run_id: RunId,
    pub experiment: String,
    pub input_shape: (usize, usize),
    pub columns: Vec<String>,
    pub seed: Option<u64>,
    pub k_min: usize,
    pub k_max: usize,
    pub started_at: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
}

/// Append-only record of one scored candidate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub parent_run_id: Option<RunId>,
    pub experiment: String,
    pub candidate: Candidate,
    pub input_shape: (usize, usize),
    pub timestamp: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
}

/// A cluster count the search could not produce a candidate for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    pub k: usize,
    pub reason: String,
}

/// Everything one search produced.
#[derive(Clone, Debug, Serialize)]
pub struct SearchResult {
    pub parent: SearchRun,
    /// Ordered by cluster count ascending.
    pub candidates: Vec<RunRecord>,
    pub skipped: Vec<SkippedCandidate>,
}

/// Run history store. Only the operations the lifecycle needs.
pub trait RunHistory: Send + Sync {
    fn open_search(&self, run: &SearchRun) -> Result<()>;
    fn append(&self, record: &RunRecord) -> Result<()>;
    fn record_skip(&self, parent: &RunId, skipped: &SkippedCandidate) -> Result<()>;
    /// Records of one experiment, best score first, earliest first on ties.
    fn top_by_score(&self, experiment: &str, limit: usize) -> Result<Vec<RunRecord>>;
    fn get(&self, run_id: &RunId) -> Result<Option<RunRecord>>;
}
