//! Candidate search and best-run selection.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::common::config::SearchCfg;
use crate::common::error::{PersonaError, Result};
use crate::common::ids::RunId;
use crate::common::time::{elapsed_ms, now_utc};
use crate::data::domain::{Dataset, FeatureVector, FEATURE_COLUMNS};

use super::domain::{Candidate, Clusterer, RunHistory, RunRecord, SearchResult, SearchRun, SkippedCandidate};
use super::kmeans::silhouette;
use super::workers::fan_out;

/// Parameters of one search.
#[derive(Clone, Debug)]
pub struct SearchSpec {
    pub experiment: String,
    pub k_min: usize,
    pub k_max: usize,
    pub seed: Option<u64>,
    pub parallelism: usize,
    pub tags: BTreeMap<String, String>,
}

impl SearchSpec {
    pub fn from_cfg(experiment: impl Into<String>, cfg: &SearchCfg) -> Self {
        Self {
            experiment: experiment.into(),
            k_min: cfg.k_min,
            k_max: cfg.k_max,
            seed: cfg.seed,
            parallelism: cfg.parallelism,
            tags: BTreeMap::new(),
        }
    }
}

fn fit_candidate(
    data: &[FeatureVector],
    k: usize,
    seed: Option<u64>,
    clusterer: &dyn Clusterer,
) -> Result<Candidate> {
    let fit = clusterer.fit(data, k, seed)?;
    let sil = silhouette(data, &fit.assignments).map_err(|err| match err {
        PersonaError::InvalidCandidate { reason, .. } => PersonaError::InvalidCandidate { k, reason },
        other => other,
    })?;
    Candidate::new(k, fit.model, fit.inertia, sil)
}

/// Train one candidate per `k` in `[k_min, k_max]` and log each as a child of
/// one parent search run.
///
/// A `k` whose fit fails is skipped and recorded; history failures abort.
pub fn search(
    dataset: &Dataset,
    spec: &SearchSpec,
    clusterer: &dyn Clusterer,
    history: &dyn RunHistory,
) -> Result<SearchResult> {
    if spec.k_min == 0 || spec.k_min > spec.k_max {
        return Err(PersonaError::invalid(format!(
            "empty cluster range [{}, {}]",
            spec.k_min, spec.k_max
        )));
    }
    if dataset.is_empty() {
        return Err(PersonaError::invalid("cannot search over an empty dataset"));
    }

    let started = Instant::now();
    let parent = SearchRun {
        run_id: RunId::generate(),
        experiment: spec.experiment.clone(),
        input_shape: dataset.shape(),
        columns: FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(),
        seed: spec.seed,
        k_min: spec.k_min,
        k_max: spec.k_max,
        started_at: now_utc(),
        tags: spec.tags.clone(),
    };
    history.open_search(&parent)?;
    if spec.seed.is_none() {
        warn!(
            experiment = %spec.experiment,
            run_id = %parent.run_id,
            "search without a fixed seed is not reproducible"
        );
    }
    info!(
        experiment = %spec.experiment,
        run_id = %parent.run_id,
        dataset = %dataset.id(),
        rows = dataset.len(),
        k_min = spec.k_min,
        k_max = spec.k_max,
        seed = ?spec.seed,
        "candidate search started"
    );

    let data = dataset.features();
    let ks: Vec<usize> = (spec.k_min..=spec.k_max).collect();
    let fits = fan_out(ks, spec.parallelism, |k| {
        (k, fit_candidate(&data, k, spec.seed, clusterer))
    });

    let mut candidates = Vec::new();
    let mut skipped = Vec::new();
    let mut last: Option<DateTime<Utc>> = None;
    for (k, fit) in fits {
        match fit {
            Ok(candidate) => {
                let timestamp = next_timestamp(last);
                last = Some(timestamp);
                let record = RunRecord {
                    run_id: RunId::generate(),
                    parent_run_id: Some(parent.run_id.clone()),
                    experiment: spec.experiment.clone(),
                    input_shape: parent.input_shape,
                    timestamp,
                    tags: spec.tags.clone(),
                    candidate,
                };
                history.append(&record)?;
                info!(
                    experiment = %spec.experiment,
                    run_id = %record.run_id,
                    k,
                    inertia = record.candidate.inertia(),
                    silhouette = record.candidate.silhouette(),
                    score = record.candidate.score(),
                    "candidate logged"
                );
                candidates.push(record);
            }
            Err(err) => {
                let skip = SkippedCandidate {
                    k,
                    reason: err.to_string(),
                };
                warn!(experiment = %spec.experiment, run_id = %parent.run_id, k, error = %err, "candidate skipped");
                history.record_skip(&parent.run_id, &skip)?;
                skipped.push(skip);
            }
        }
    }

    info!(
        experiment = %spec.experiment,
        run_id = %parent.run_id,
        candidates = candidates.len(),
        skipped = skipped.len(),
        dur_ms = elapsed_ms(started),
        "candidate search finished"
    );
    Ok(SearchResult {
        parent,
        candidates,
        skipped,
    })
}

/// Strictly increasing timestamps within one search, so earliest-first
/// tie-breaking follows k order.
fn next_timestamp(last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = now_utc();
    match last {
        Some(prev) if now <= prev => prev + Duration::microseconds(1),
        _ => now,
    }
}

/// Selection order: score descending, then earliest timestamp, then run id.
pub fn rank(a: &RunRecord, b: &RunRecord) -> Ordering {
    b.candidate
        .score()
        .total_cmp(&a.candidate.score())
        .then_with(|| a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.run_id.cmp(&b.run_id))
}

/// The single best record.
pub fn select_best<'a>(experiment: &str, records: &'a [RunRecord]) -> Result<&'a RunRecord> {
    records
        .iter()
        .min_by(|a, b| rank(a, b))
        .ok_or_else(|| PersonaError::NoCandidates {
            experiment: experiment.to_string(),
        })
}

/// Select over the top `top_n` records the history holds for `experiment`.
pub fn select_best_from_history(
    history: &dyn RunHistory,
    experiment: &str,
    top_n: usize,
) -> Result<RunRecord> {
    let records = history.top_by_score(experiment, top_n)?;
    let best = select_best(experiment, &records)?.clone();
    info!(
        experiment,
        run_id = %best.run_id,
        k = best.candidate.cluster_count(),
        score = best.candidate.score(),
        considered = records.len(),
        "best run selected"
    );
    Ok(best)
}
