//! Prediction, the serving model handle and batch scoring.

pub mod batch;
pub mod domain;
pub mod remote;
pub mod service;

pub use batch::BatchSummary;
pub use domain::{ActiveModel, FeatureRow, LoadedModel, PredictResponse, Predictor};
pub use remote::HttpPredictor;
pub use service::{load_active, reload};
