//! Retraining orchestration: drift gate, search, selection, promotion, notify.

use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::common::error::Result;
use crate::common::time::elapsed_ms;
use crate::data::domain::Dataset;
use crate::evaluation::domain::{DriftTest, DriftVerdict};
use crate::evaluation::service::detect;
use crate::registry::domain::{ModelRegistry, PromotionResult, RegistryEntry};
use crate::registry::service::register_and_promote;
use crate::training::domain::{Clusterer, RunHistory, RunRecord, SkippedCandidate};
use crate::training::service::{search, select_best_from_history, SearchSpec};

use super::notify::Notifier;

/// What one orchestration pass ended with.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetrainOutcome {
    /// Current data matches the reference; nothing trained.
    NoDrift { verdict: DriftVerdict },
    /// A new version now serves.
    Promoted {
        verdict: DriftVerdict,
        entry: RegistryEntry,
        archived: Option<u32>,
        best: RunRecord,
        candidates: usize,
        skipped: Vec<SkippedCandidate>,
    },
    /// Drift was found but the best run already serves.
    Unchanged {
        verdict: DriftVerdict,
        entry: RegistryEntry,
        candidates: usize,
        skipped: Vec<SkippedCandidate>,
    },
}

/// Collaborators and settings for the retrain loop.
pub struct RetrainingOrchestrator<'a> {
    pub drift: &'a dyn DriftTest,
    pub clusterer: &'a dyn Clusterer,
    pub history: &'a dyn RunHistory,
    pub registry: &'a dyn ModelRegistry,
    pub notifier: &'a dyn Notifier,
    pub model_name: String,
    pub search: SearchSpec,
    /// How many stored runs the selector looks at.
    pub history_top_n: usize,
    pub no_drift_message: String,
}

impl RetrainingOrchestrator<'_> {
    /// One pass over `reference` (data behind the serving model) and
    /// `current` (newly arrived data).
    pub fn run(&self, reference: &Dataset, current: &Dataset) -> Result<RetrainOutcome> {
        let started = Instant::now();
        let verdict = detect(self.drift, reference, current)?;
        if !verdict.is_drifted {
            self.send(&self.no_drift_message);
            info!(model_name = %self.model_name, dur_ms = elapsed_ms(started), "no drift, retraining skipped");
            return Ok(RetrainOutcome::NoDrift { verdict });
        }

        info!(
            model_name = %self.model_name,
            drift_share = verdict.report.drift_share,
            "drift detected, retraining"
        );
        let result = search(current, &self.search, self.clusterer, self.history)?;
        let best = select_best_from_history(self.history, &self.search.experiment, self.history_top_n)?;
        let promotion = register_and_promote(self.registry, &self.model_name, &best.run_id)?;

        let candidates = result.candidates.len();
        let outcome = match promotion {
            PromotionResult::Promoted { entry, archived } => {
                self.send(&format!(
                    "*Data drift detected.* Model `{}` v{} promoted to production (k={}, score={:.4}).",
                    entry.model_name,
                    entry.version,
                    best.candidate.cluster_count(),
                    best.candidate.score()
                ));
                RetrainOutcome::Promoted {
                    verdict,
                    entry,
                    archived,
                    best,
                    candidates,
                    skipped: result.skipped,
                }
            }
            PromotionResult::AlreadyActive { entry } => {
                self.send(&format!(
                    "*Data drift detected.* Best run already serves as `{}` v{}; no promotion.",
                    entry.model_name, entry.version
                ));
                RetrainOutcome::Unchanged {
                    verdict,
                    entry,
                    candidates,
                    skipped: result.skipped,
                }
            }
        };
        info!(model_name = %self.model_name, dur_ms = elapsed_ms(started), "retraining pass finished");
        Ok(outcome)
    }

    /// Delivery failures never undo the work already done.
    fn send(&self, text: &str) {
        if let Err(err) = self.notifier.notify(text) {
            warn!(model_name = %self.model_name, error = %err, "notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::PersonaError;
    use crate::data::synth::{generate, BlobSpec};
    use crate::evaluation::stattest::StatTestDrift;
    use crate::registry::domain::Stage;
    use crate::registry::memory::MemoryRegistry;
    use crate::training::kmeans::KMeans;
    use crate::training::memory::MemoryRunHistory;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Notifier for Recorder {
        fn notify(&self, text: &str) -> Result<()> {
            self.sent.lock().push(text.to_string());
            if self.fail {
                return Err(PersonaError::external("notification channel", "unreachable"));
            }
            Ok(())
        }
    }

    fn blobs(seed: u64, std: f64, month: u32) -> Dataset {
        let spec = BlobSpec {
            rows: 90,
            cluster_std: std,
            seed,
            year: 2025,
            month,
        };
        Dataset::new(generate(&spec).unwrap().records)
    }

    fn spec() -> SearchSpec {
        SearchSpec {
            experiment: "exp".into(),
            k_min: 2,
            k_max: 4,
            seed: Some(11),
            parallelism: 2,
            tags: BTreeMap::new(),
        }
    }

    fn orchestrator<'a>(
        drift: &'a StatTestDrift,
        clusterer: &'a KMeans,
        history: &'a MemoryRunHistory,
        registry: &'a MemoryRegistry,
        notifier: &'a Recorder,
    ) -> RetrainingOrchestrator<'a> {
        RetrainingOrchestrator {
            drift,
            clusterer,
            history,
            registry,
            notifier,
            model_name: "m".into(),
            search: spec(),
            history_top_n: 100,
            no_drift_message: "nothing to do".into(),
        }
    }

    #[test]
    fn no_drift_only_notifies() {
        let (drift, km, history, registry, notifier) = (
            StatTestDrift::default(),
            KMeans::default(),
            MemoryRunHistory::default(),
            MemoryRegistry::default(),
            Recorder::default(),
        );
        let orch = orchestrator(&drift, &km, &history, &registry, &notifier);
        let data = blobs(1, 1.0, 1);
        let outcome = orch.run(&data, &data).unwrap();
        assert!(matches!(outcome, RetrainOutcome::NoDrift { .. }));
        assert!(registry.list_versions("m").unwrap().is_empty());
        assert_eq!(*notifier.sent.lock(), vec!["nothing to do".to_string()]);
    }

    #[test]
    fn drift_promotes_and_survives_notification_failure() {
        let (drift, km, history, registry) = (
            StatTestDrift::default(),
            KMeans::default(),
            MemoryRunHistory::default(),
            MemoryRegistry::default(),
        );
        let notifier = Recorder {
            fail: true,
            ..Recorder::default()
        };
        let orch = orchestrator(&drift, &km, &history, &registry, &notifier);
        let outcome = orch.run(&blobs(1, 0.5, 1), &blobs(2, 5.0, 2)).unwrap();
        match outcome {
            RetrainOutcome::Promoted { entry, candidates, .. } => {
                assert_eq!(entry.version, 1);
                assert_eq!(entry.stage, Stage::Production);
                assert_eq!(candidates, 3);
            }
            other => panic!("expected promotion, got {other:?}"),
        }
        assert_eq!(registry.get_active("m").unwrap().unwrap().version, 1);
        let sent = notifier.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("`m` v1 promoted"), "{}", sent[0]);
    }

    #[test]
    fn rerun_does_not_double_promote_a_worse_search() {
        let (drift, km, history, registry, notifier) = (
            StatTestDrift::default(),
            KMeans::default(),
            MemoryRunHistory::default(),
            MemoryRegistry::default(),
            Recorder::default(),
        );
        let orch = orchestrator(&drift, &km, &history, &registry, &notifier);
        let reference = blobs(1, 0.5, 1);
        let current = blobs(2, 5.0, 2);
        orch.run(&reference, &current).unwrap();
        // Same seed and data: identical scores, so the earlier run keeps winning.
        let second = orch.run(&reference, &current).unwrap();
        assert!(matches!(second, RetrainOutcome::Unchanged { .. }));
        assert_eq!(registry.list_versions("m").unwrap().len(), 1);
    }
}
