//! Prediction contract, wire types and the swappable active-model handle.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::common::error::{PersonaError, Result};
use crate::common::ids::RunId;
use crate::data::domain::FeatureVector;
use crate::training::domain::ClusterModel;

/// Anything that maps feature vectors to persona labels, one per input.
pub trait Predictor: Send + Sync {
    fn predict(&self, rows: &[FeatureVector]) -> Result<Vec<i64>>;
}

/// One feature vector as it travels over HTTP: `{"x1": .., .., "x10": ..}`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub x1: f64,
    pub x2: f64,
    pub x3: f64,
    pub x4: f64,
    pub x5: f64,
    pub x6: f64,
    pub x7: f64,
    pub x8: f64,
    pub x9: f64,
    pub x10: f64,
}

impl From<&FeatureVector> for FeatureRow {
    fn from(v: &FeatureVector) -> Self {
        Self {
            x1: v[0],
            x2: v[1],
            x3: v[2],
            x4: v[3],
            x5: v[4],
            x6: v[5],
            x7: v[6],
            x8: v[7],
            x9: v[8],
            x10: v[9],
        }
    }
}

impl From<FeatureRow> for FeatureVector {
    fn from(r: FeatureRow) -> Self {
        [r.x1, r.x2, r.x3, r.x4, r.x5, r.x6, r.x7, r.x8, r.x9, r.x10]
    }
}

/// Body of a `/predict` response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub labels: Vec<i64>,
}

/// A production model resolved from the registry, ready to predict.
#[derive(Clone, Debug, Serialize)]
pub struct LoadedModel {
    pub model_name: String,
    pub version: u32,
    pub run_id: RunId,
    #[serde(skip)]
    pub model: ClusterModel,
}

impl Predictor for LoadedModel {
    fn predict(&self, rows: &[FeatureVector]) -> Result<Vec<i64>> {
        Ok(self.model.predict(rows).into_iter().map(|l| l as i64).collect())
    }
}

/// Shared handle to the serving model.
///
/// Cloning shares the slot. Readers take an `Arc` snapshot, so a reload swaps
/// the whole model at once and requests in flight keep the one they started
/// with.
#[derive(Clone, Default)]
pub struct ActiveModel {
    slot: Arc<RwLock<Option<Arc<LoadedModel>>>>,
}

impl ActiveModel {
    pub fn new(model: LoadedModel) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(Arc::new(model)))),
        }
    }

    pub fn current(&self) -> Option<Arc<LoadedModel>> {
        self.slot.read().clone()
    }

    /// Install `model`, returning the one it replaced.
    pub fn replace(&self, model: LoadedModel) -> Option<Arc<LoadedModel>> {
        self.slot.write().replace(Arc::new(model))
    }
}

impl Predictor for ActiveModel {
    fn predict(&self, rows: &[FeatureVector]) -> Result<Vec<i64>> {
        let model = self
            .current()
            .ok_or_else(|| PersonaError::not_found("loaded model", "active slot"))?;
        model.predict(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(version: u32, centroids: Vec<FeatureVector>) -> LoadedModel {
        LoadedModel {
            model_name: "m".into(),
            version,
            run_id: RunId::new(format!("run{version}")),
            model: ClusterModel::new(centroids).unwrap(),
        }
    }

    #[test]
    fn wire_row_uses_named_columns() {
        let v: FeatureVector = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        let json = serde_json::to_value(FeatureRow::from(&v)).unwrap();
        assert_eq!(json["x1"], 1.0);
        assert_eq!(json["x10"], 10.0);
        let back: FeatureRow = serde_json::from_value(json).unwrap();
        assert_eq!(FeatureVector::from(back), v);
    }

    #[test]
    fn empty_handle_refuses_to_predict() {
        let handle = ActiveModel::default();
        assert!(matches!(
            handle.predict(&[[0.0; 10]]).unwrap_err(),
            PersonaError::NotFound { .. }
        ));
    }

    #[test]
    fn replace_swaps_whole_model() {
        let handle = ActiveModel::new(loaded(1, vec![[0.0; 10], [10.0; 10]]));
        let before = handle.current().unwrap();
        let old = handle.replace(loaded(2, vec![[10.0; 10], [0.0; 10]])).unwrap();
        assert_eq!(old.version, 1);
        // Snapshot taken before the swap still answers with the old model.
        assert_eq!(before.predict(&[[0.0; 10]]).unwrap(), vec![0]);
        assert_eq!(handle.predict(&[[0.0; 10]]).unwrap(), vec![1]);
        assert_eq!(handle.current().unwrap().version, 2);
    }
}
